//! GSM driver: sub-modules.

pub mod types;
pub mod transport;
pub mod codec;
pub mod channel;
pub mod init;
pub mod sms;
pub mod receiver;
pub mod service;

// Re-export top-level items for convenience.
pub use types::*;
pub use channel::CommandChannel;
pub use receiver::{MessageSink, ReceiverLoop};
pub use service::SmsGateway;
pub use sms::SmsClient;
pub use transport::{list_ports, NativeTransport, SerialTransport, SimulatedTransport};
