//! # sms-modem – GSM/GPRS SMS driver
//!
//! Drives a GSM/GPRS modem (SIM800-class) over a serial link using the
//! AT command set in text mode with the UCS2 character set:
//!
//! - **Transport** – abstracted byte I/O over a serial port, with a
//!   native `serialport` backend and in-memory test doubles
//! - **Codec** – UCS2 hex transcoding and the `+CMGL:` list grammar
//! - **Command Channel** – one-at-a-time AT execution with terminal
//!   token detection, echo filtering, and the `>` prompt special case
//! - **Initialization** – cold-start handshake: probe, SIM readiness,
//!   network registration, text-mode/UCS2/storage configuration
//! - **SMS Operations** – send, list, delete-read, clear-all, plus
//!   signal quality and modem identification
//! - **Receiver Loop** – drift-free background poller dispatching new
//!   messages to an injected sink exactly once per poll

pub mod gsm;
