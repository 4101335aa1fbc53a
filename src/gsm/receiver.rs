//! Polling receiver loop.
//!
//! Inbound SMS arrive by polling `AT+CMGL="REC UNREAD"` on a fixed
//! interval. The listing itself transitions the returned messages to
//! read in modem storage, so each message is observed exactly once
//! without any bookkeeping on this side. Dispatch goes through the
//! `MessageSink` trait: one message at a time, in arrival order, with
//! sink failures logged and contained so the loop keeps running.

use crate::gsm::sms::SmsClient;
use crate::gsm::types::{ModemConfig, SmsMessage};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

/// Consumer of inbound messages.
///
/// Implementations decide what delivery means (queue, webhook, log).
/// A returned error marks the message as not delivered; the loop logs
/// it and moves on.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: SmsMessage) -> Result<(), String>;
}

/// Periodic unread poller dispatching into a sink.
pub struct ReceiverLoop {
    client: Arc<SmsClient>,
    sink: Arc<dyn MessageSink>,
    poll_interval: Duration,
    delete_after_dispatch: bool,
}

impl ReceiverLoop {
    pub fn new(client: Arc<SmsClient>, sink: Arc<dyn MessageSink>, config: &ModemConfig) -> Self {
        Self {
            client,
            sink,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            delete_after_dispatch: config.delete_after_dispatch,
        }
    }

    /// Run the loop on its own task. Runs until aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        log::info!(
            "Receiver polling every {}ms",
            self.poll_interval.as_millis()
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        // A slow poll must not cause a burst of catch-up polls.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One poll cycle. Returns the number of messages the sink
    /// accepted.
    pub async fn poll_once(&self) -> usize {
        let messages = match self.client.list(false).await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Unread poll failed: {}", e);
                return 0;
            }
        };
        if !messages.is_empty() {
            log::info!("{} new message(s)", messages.len());
        }

        let mut dispatched = 0;
        for message in messages {
            let index = message.index;
            let phone = message.phone.clone();
            match self.sink.deliver(message).await {
                Ok(()) => {
                    dispatched += 1;
                    if self.delete_after_dispatch {
                        if let Some(idx) = index {
                            if let Err(e) = self.client.delete_index(idx).await {
                                log::warn!("Failed to delete dispatched message {}: {}", idx, e);
                            }
                        }
                    }
                }
                Err(e) => log::warn!("Sink rejected message from {}: {}", phone, e),
            }
        }
        dispatched
    }
}
