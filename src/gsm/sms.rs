//! SMS operations over an initialized modem.
//!
//! Every operation is gated on full initialization and rejected with
//! `NotReady` before touching the wire. The send path folds all
//! failures into a structured `SendResult` instead of propagating
//! them, so a flaky modem cannot take a dispatch loop down with it.
//! Diagnostics (`+CSQ`, identification) are exempt from the readiness
//! gate since they are useful while the modem is still booting.

use crate::gsm::channel::CommandChannel;
use crate::gsm::codec::{encode_ucs2, parse_list_response};
use crate::gsm::types::{
    AtCommand, CommandOutcome, CommandResponse, GsmError, ModemConfig, ModemInfo, ModemReadiness,
    SendResult, SignalQuality, SmsMessage, SmsStatus,
};
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Signal quality helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract `(rssi, ber)` from a `+CSQ` response.
pub fn parse_signal_quality(response: &str) -> Option<(i32, i32)> {
    let re = regex::Regex::new(r"\+CSQ:\s*(\d+),\s*(\d+)").ok()?;
    let caps = re.captures(response)?;
    let rssi = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let ber = caps.get(2)?.as_str().parse::<i32>().ok()?;
    Some((rssi, ber))
}

/// Convert CSQ RSSI value to dBm.
pub fn rssi_to_dbm(rssi: i32) -> Option<i32> {
    match rssi {
        0 => Some(-113),
        1 => Some(-111),
        v @ 2..=30 => Some(-109 + (v - 2) * 2),
        31 => Some(-51),
        99 => None, // not known
        _ => None,
    }
}

/// Signal quality description based on RSSI value.
pub fn rssi_description(rssi: i32) -> &'static str {
    match rssi {
        0..=9 => "Marginal",
        10..=14 => "OK",
        15..=19 => "Good",
        20..=30 => "Excellent",
        31 => "Maximum",
        _ => "Unknown",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SMS client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// High-level SMS operations bound to one command channel.
pub struct SmsClient {
    channel: Arc<CommandChannel>,
    readiness: Arc<ModemReadiness>,
    config: ModemConfig,
}

impl SmsClient {
    pub fn new(
        channel: Arc<CommandChannel>,
        readiness: Arc<ModemReadiness>,
        config: ModemConfig,
    ) -> Self {
        Self {
            channel,
            readiness,
            config,
        }
    }

    fn ensure_ready(&self) -> Result<(), GsmError> {
        if self.readiness.is_fully_ready() {
            return Ok(());
        }
        let state = self.readiness.snapshot();
        Err(GsmError::NotReady(format!(
            "responsive={} sim={} registered={} mode={}",
            state.responsive, state.sim_ready, state.registered, state.mode_configured
        )))
    }

    /// Send one SMS. Never fails with an `Err`; every failure mode is
    /// folded into the returned `SendResult`.
    pub async fn send(&self, phone: &str, message: &str) -> SendResult {
        match self.try_send(phone, message).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("SMS send to {} failed: {}", phone, e);
                SendResult::failed(e.to_string(), String::new())
            }
        }
    }

    async fn try_send(&self, phone: &str, message: &str) -> Result<SendResult, GsmError> {
        self.ensure_ready()?;

        // Re-assert the volatile mode settings. Some firmwares fall
        // back to PDU mode after storage operations; a refusal here is
        // tolerable since the settings usually still hold from init.
        for text in ["AT+CMGF=1", "AT+CSCS=\"UCS2\""] {
            let resp = self
                .channel
                .execute(&AtCommand::new(text, self.config.command_timeout_ms))
                .await?;
            if !resp.outcome.is_ok() {
                log::warn!("{} rejected before send: {:?}", text, resp.outcome);
            }
        }

        let header = AtCommand::new(
            format!("AT+CMGS=\"{}\"", encode_ucs2(phone)),
            self.config.command_timeout_ms,
        )
        .expecting_prompt();
        let resp = self
            .channel
            .execute_with_payload(
                &header,
                encode_ucs2(message).as_bytes(),
                self.config.send_timeout_ms,
            )
            .await?;

        let result = match &resp.outcome {
            CommandOutcome::Ok => SendResult::sent(resp.raw_response),
            CommandOutcome::Error(code) => {
                SendResult::failed(format!("modem error {}", code), resp.raw_response)
            }
            CommandOutcome::Timeout => SendResult::failed(
                "timed out waiting for send confirmation",
                resp.raw_response,
            ),
        };
        if result.success {
            log::info!("SMS sent to {}", phone);
        } else {
            log::warn!(
                "SMS to {} failed: {}",
                phone,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(result)
    }

    /// List stored messages. `include_read` selects `"ALL"` over
    /// `"REC UNREAD"`. Listing unread transitions those messages to
    /// read in modem storage, which is what keeps polling exactly-once.
    pub async fn list(&self, include_read: bool) -> Result<Vec<SmsMessage>, GsmError> {
        self.ensure_ready()?;
        let filter = if include_read { "ALL" } else { "REC UNREAD" };
        let cmd = AtCommand::new(
            format!("AT+CMGL=\"{}\"", filter),
            self.config.list_timeout_ms,
        );
        let resp = self.channel.execute(&cmd).await?;
        require_ok(&resp)?;
        Ok(parse_list_response(&resp.lines.join("\n")))
    }

    /// Delete one message by storage index.
    pub async fn delete_index(&self, index: u32) -> Result<(), GsmError> {
        self.ensure_ready()?;
        let cmd = AtCommand::new(
            format!("AT+CMGD={}", index),
            self.config.command_timeout_ms,
        );
        let resp = self.channel.execute(&cmd).await?;
        require_ok(&resp)
    }

    /// Delete all messages already marked read. Messages that fail to
    /// delete are logged and skipped; the indices actually deleted are
    /// returned.
    pub async fn delete_read(&self) -> Result<Vec<u32>, GsmError> {
        let read: Vec<SmsMessage> = self
            .list(true)
            .await?
            .into_iter()
            .filter(|m| m.status == SmsStatus::Read)
            .collect();

        let mut deleted = Vec::new();
        for msg in read {
            // Entries without a parseable index cannot be addressed.
            let Some(index) = msg.index else { continue };
            match self.delete_index(index).await {
                Ok(()) => deleted.push(index),
                Err(e) => log::warn!("Failed to delete message {}: {}", index, e),
            }
        }
        log::info!("Deleted {} read message(s)", deleted.len());
        Ok(deleted)
    }

    /// Wipe the whole message store (`AT+CMGD=1,4`).
    pub async fn clear_all(&self) -> Result<(), GsmError> {
        self.ensure_ready()?;
        let cmd = AtCommand::new("AT+CMGD=1,4", self.config.clear_timeout_ms);
        let resp = self.channel.execute(&cmd).await?;
        require_ok(&resp)?;
        log::info!("Message store cleared");
        Ok(())
    }

    /// Query `+CSQ`. Unparseable responses degrade to the unknown
    /// reading rather than an error.
    pub async fn signal_quality(&self) -> Result<SignalQuality, GsmError> {
        let resp = self
            .channel
            .execute(&AtCommand::new("AT+CSQ", self.config.command_timeout_ms))
            .await?;
        require_ok(&resp)?;

        let (rssi, ber) = match parse_signal_quality(&resp.raw_response) {
            Some(pair) => pair,
            None => {
                log::warn!("Unparseable +CSQ response: {:?}", resp.raw_response);
                (99, 99)
            }
        };
        Ok(SignalQuality {
            rssi,
            ber,
            dbm: rssi_to_dbm(rssi),
            description: rssi_description(rssi).to_string(),
        })
    }

    /// Query modem identification. Each field is best-effort.
    pub async fn modem_info(&self) -> Result<ModemInfo, GsmError> {
        Ok(ModemInfo {
            manufacturer: self.query_field("AT+CGMI").await?,
            model: self.query_field("AT+CGMM").await?,
            serial_number: self.query_field("AT+CGSN").await?,
        })
    }

    async fn query_field(&self, text: &str) -> Result<Option<String>, GsmError> {
        let resp = self
            .channel
            .execute(&AtCommand::new(text, self.config.command_timeout_ms))
            .await?;
        if resp.outcome.is_ok() {
            Ok(resp.lines.first().cloned())
        } else {
            Ok(None)
        }
    }
}

fn require_ok(resp: &CommandResponse) -> Result<(), GsmError> {
    match &resp.outcome {
        CommandOutcome::Ok => Ok(()),
        CommandOutcome::Error(code) => Err(GsmError::Modem { code: code.clone() }),
        CommandOutcome::Timeout => Err(GsmError::Timeout),
    }
}
