//! Shared types for the GSM driver.
//!
//! Covers modem configuration, AT command/response shapes, SMS message
//! records, readiness state, and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Modem configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Complete modem driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemConfig {
    /// Port name (e.g. `/dev/serial0`, `COM3`).
    pub port_name: String,

    /// Baud rate. SIM800-class modules default to 9600.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Per-read blocking window on the underlying port, milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Default timeout for ordinary AT commands, milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Timeout for the `+CMGL` list exchange, milliseconds.
    #[serde(default = "default_list_timeout")]
    pub list_timeout_ms: u64,

    /// Timeout for the final CMGS confirmation after Ctrl+Z,
    /// milliseconds. Sending over the air is the slowest exchange.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Timeout for the bulk `AT+CMGD=1,4` delete, milliseconds.
    #[serde(default = "default_clear_timeout")]
    pub clear_timeout_ms: u64,

    /// Interval between initialization step retries, milliseconds.
    #[serde(default = "default_init_retry_interval")]
    pub init_retry_interval_ms: u64,

    /// Overall deadline for the initialization handshake, milliseconds.
    /// Exceeding it is fatal: the gateway refuses to start.
    #[serde(default = "default_init_deadline")]
    pub init_deadline_ms: u64,

    /// Receiver poll period, milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delete a message slot after its sink dispatch succeeds.
    /// Off by default: unread lifecycle is the caller's policy.
    #[serde(default)]
    pub delete_after_dispatch: bool,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_read_timeout() -> u64 {
    100
}
fn default_command_timeout() -> u64 {
    2000
}
fn default_list_timeout() -> u64 {
    5000
}
fn default_send_timeout() -> u64 {
    10_000
}
fn default_clear_timeout() -> u64 {
    5000
}
fn default_init_retry_interval() -> u64 {
    1000
}
fn default_init_deadline() -> u64 {
    30_000
}
fn default_poll_interval() -> u64 {
    5000
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            command_timeout_ms: default_command_timeout(),
            list_timeout_ms: default_list_timeout(),
            send_timeout_ms: default_send_timeout(),
            clear_timeout_ms: default_clear_timeout(),
            init_retry_interval_ms: default_init_retry_interval(),
            init_deadline_ms: default_init_deadline(),
            poll_interval_ms: default_poll_interval(),
            delete_after_dispatch: false,
        }
    }
}

impl ModemConfig {
    /// Config for the given port with everything else at defaults.
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }
}

/// Terminal-token set recognized by the command channel.
///
/// The safe minimal set is the default; modem families that use
/// additional final result codes can extend it instead of patching
/// the read loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Lines that terminate a command successfully.
    pub success_tokens: Vec<String>,
    /// Lines that terminate a command as failed.
    pub failure_tokens: Vec<String>,
    /// Line prefixes that terminate a command as failed; the trailing
    /// text is the error code.
    pub failure_prefixes: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            success_tokens: vec!["OK".to_string()],
            failure_tokens: vec!["ERROR".to_string()],
            failure_prefixes: vec!["+CMS ERROR:".to_string(), "+CME ERROR:".to_string()],
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  AT command / response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One AT command to execute. Ephemeral: built per invocation and
/// consumed by the channel.
#[derive(Debug, Clone)]
pub struct AtCommand {
    /// Command text without the trailing carriage return.
    pub text: String,
    /// Timeout for the full round trip, milliseconds.
    pub timeout_ms: u64,
    /// Terminate successfully on the `>` body-injection prompt
    /// instead of waiting for `OK` (used by `AT+CMGS`).
    pub expect_prompt: bool,
}

impl AtCommand {
    pub fn new(text: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            text: text.into(),
            timeout_ms,
            expect_prompt: false,
        }
    }

    /// Mark this command as terminated by the `>` prompt.
    pub fn expecting_prompt(mut self) -> Self {
        self.expect_prompt = true;
        self
    }
}

/// How a command exchange ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandOutcome {
    /// Terminal success token (or the `>` prompt when expected).
    Ok,
    /// Modem reported failure; carries the error code text.
    Error(String),
    /// No terminal token arrived within the timeout.
    Timeout,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result of one AT command exchange. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// The AT command sent.
    pub command: String,
    /// Informational lines, echo and terminal token stripped.
    pub lines: Vec<String>,
    /// Final classification.
    pub outcome: CommandOutcome,
    /// Full raw response text as captured off the wire.
    pub raw_response: String,
    /// Elapsed time in milliseconds.
    pub elapsed_ms: u64,
}

impl CommandResponse {
    /// Whether any informational line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SMS messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Storage status of a listed SMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SmsStatus {
    Unread,
    Read,
    Unknown(String),
}

impl SmsStatus {
    /// Parse the quoted status token from a `+CMGL:` header.
    pub fn parse(token: &str) -> Self {
        match token {
            "REC UNREAD" => Self::Unread,
            "REC READ" => Self::Read,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The modem-native token for this status.
    pub fn label(&self) -> &str {
        match self {
            Self::Unread => "REC UNREAD",
            Self::Read => "REC READ",
            Self::Unknown(raw) => raw,
        }
    }
}

/// One received SMS message.
///
/// `index` is the SIM slot and is present iff the message came from a
/// list response; synthesized messages carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessage {
    pub index: Option<u32>,
    pub status: SmsStatus,
    /// Sender phone number, UCS2-decoded.
    pub phone: String,
    /// Message body, UCS2-decoded.
    pub content: String,
    /// Modem-native timestamp, passed through verbatim.
    pub timestamp: String,
}

/// Structured result of a send attempt. Returned in all cases; the
/// send path never propagates an error past this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    /// `"sent"` or `"failed"`.
    pub status: String,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
    /// Raw text of the final modem response.
    pub raw_response: String,
    /// When the attempt completed.
    pub completed_at: DateTime<Utc>,
}

impl SendResult {
    pub fn sent(raw_response: String) -> Self {
        Self {
            success: true,
            status: "sent".to_string(),
            error: None,
            raw_response,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>, raw_response: String) -> Self {
        Self {
            success: false,
            status: "failed".to_string(),
            error: Some(error.into()),
            raw_response,
            completed_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Diagnostics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Modem identification information (best-effort fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
}

/// Parsed `+CSQ` signal quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuality {
    pub rssi: i32,
    pub ber: i32,
    pub dbm: Option<i32>,
    pub description: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Readiness state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot of the initialization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemState {
    pub responsive: bool,
    pub sim_ready: bool,
    pub registered: bool,
    pub mode_configured: bool,
}

impl ModemState {
    pub fn is_fully_ready(&self) -> bool {
        self.responsive && self.sim_ready && self.registered && self.mode_configured
    }
}

/// Shared readiness flags, advanced monotonically by the init
/// sequencer and never reset except by reopening the transport.
pub struct ModemReadiness {
    responsive: AtomicBool,
    sim_ready: AtomicBool,
    registered: AtomicBool,
    mode_configured: AtomicBool,
}

impl ModemReadiness {
    pub fn new() -> Self {
        Self {
            responsive: AtomicBool::new(false),
            sim_ready: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            mode_configured: AtomicBool::new(false),
        }
    }

    pub fn set_responsive(&self) {
        self.responsive.store(true, Ordering::SeqCst);
    }

    pub fn set_sim_ready(&self) {
        self.sim_ready.store(true, Ordering::SeqCst);
    }

    pub fn set_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    pub fn set_mode_configured(&self) {
        self.mode_configured.store(true, Ordering::SeqCst);
    }

    pub fn is_fully_ready(&self) -> bool {
        self.snapshot().is_fully_ready()
    }

    pub fn snapshot(&self) -> ModemState {
        ModemState {
            responsive: self.responsive.load(Ordering::SeqCst),
            sim_ready: self.sim_ready.load(Ordering::SeqCst),
            registered: self.registered.load(Ordering::SeqCst),
            mode_configured: self.mode_configured.load(Ordering::SeqCst),
        }
    }
}

impl Default for ModemReadiness {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error taxonomy for the driver.
///
/// Command-level timeouts and modem `ERROR` results normally travel
/// inside [`CommandOutcome`] so callers pick their own retry policy;
/// they surface here only where an operation has a single answer
/// (list, delete, clear).
#[derive(Debug, Clone, thiserror::Error)]
pub enum GsmError {
    /// I/O failure on the underlying serial connection. Fatal to the
    /// current session; no automatic reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// `+CMS ERROR` / `+CME ERROR` / bare `ERROR` from the modem.
    #[error("modem error: {code}")]
    Modem { code: String },

    /// No terminal token within the allotted window.
    #[error("command timed out")]
    Timeout,

    /// An SMS operation was invoked before initialization completed.
    /// Rejected without touching the transport.
    #[error("modem not ready: {0}")]
    NotReady(String),

    /// The initialization handshake missed its overall deadline.
    #[error("initialization failed: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = ModemConfig::for_port("/dev/serial0");
        assert_eq!(cfg.port_name, "/dev/serial0");
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.command_timeout_ms, 2000);
        assert_eq!(cfg.send_timeout_ms, 10_000);
        assert_eq!(cfg.clear_timeout_ms, 5000);
        assert!(!cfg.delete_after_dispatch);
    }

    #[test]
    fn test_config_serde_field_defaults() {
        let cfg: ModemConfig = serde_json::from_str(r#"{"portName":"COM3"}"#).unwrap();
        assert_eq!(cfg.port_name, "COM3");
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.poll_interval_ms, 5000);
    }

    #[test]
    fn test_channel_config_default_tokens() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.success_tokens, vec!["OK"]);
        assert_eq!(cfg.failure_tokens, vec!["ERROR"]);
        assert!(cfg.failure_prefixes.contains(&"+CMS ERROR:".to_string()));
        assert!(cfg.failure_prefixes.contains(&"+CME ERROR:".to_string()));
    }

    #[test]
    fn test_sms_status_parse() {
        assert_eq!(SmsStatus::parse("REC UNREAD"), SmsStatus::Unread);
        assert_eq!(SmsStatus::parse("REC READ"), SmsStatus::Read);
        assert_eq!(
            SmsStatus::parse("STO SENT"),
            SmsStatus::Unknown("STO SENT".to_string())
        );
    }

    #[test]
    fn test_sms_status_label_roundtrip() {
        for token in ["REC UNREAD", "REC READ", "STO SENT"] {
            assert_eq!(SmsStatus::parse(token).label(), token);
        }
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(CommandOutcome::Ok.is_ok());
        assert!(CommandOutcome::Error("321".to_string()).is_error());
        assert!(CommandOutcome::Timeout.is_timeout());
    }

    #[test]
    fn test_readiness_monotonic_flags() {
        let r = ModemReadiness::new();
        assert!(!r.is_fully_ready());
        r.set_responsive();
        r.set_sim_ready();
        r.set_registered();
        assert!(!r.is_fully_ready());
        r.set_mode_configured();
        assert!(r.is_fully_ready());
        let snap = r.snapshot();
        assert!(snap.responsive && snap.sim_ready && snap.registered && snap.mode_configured);
    }

    #[test]
    fn test_send_result_shapes() {
        let ok = SendResult::sent("OK".to_string());
        assert!(ok.success);
        assert_eq!(ok.status, "sent");
        assert!(ok.error.is_none());

        let bad = SendResult::failed("+CMS ERROR: 500", String::new());
        assert!(!bad.success);
        assert_eq!(bad.status, "failed");
        assert_eq!(bad.error.as_deref(), Some("+CMS ERROR: 500"));
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let msg = SmsMessage {
            index: Some(3),
            status: SmsStatus::Unread,
            phone: "+4552228856".to_string(),
            content: "hej".to_string(),
            timestamp: "24/10/30,18:31:31+04".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: SmsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
