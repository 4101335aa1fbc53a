//! Serialized AT command execution.
//!
//! One command at a time owns the wire: a single async mutex is held
//! for the full round trip (stale-input discard, write, read until a
//! terminal token or timeout) and released on every exit path. The
//! serial link has no framing beyond line boundaries plus a terminal
//! token heuristic, so two interleaved commands would corrupt each
//! other's responses.
//!
//! No implicit retry here: `Timeout` and modem errors are returned to
//! the caller as outcomes, and retry policy stays with the caller. A
//! timeout is recoverable: the deadline is checked between bounded
//! transport reads rather than by cancelling an in-flight read, so it
//! never strands state a transport holds across its read.

use crate::gsm::transport::SerialTransport;
use crate::gsm::types::{AtCommand, ChannelConfig, CommandOutcome, CommandResponse, GsmError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant as TokioInstant};

/// End-of-body marker for SMS injection.
pub const CTRL_Z: u8 = 0x1A;

/// Serializes AT command execution over a shared transport.
pub struct CommandChannel {
    transport: Arc<dyn SerialTransport>,
    config: ChannelConfig,
    wire: Mutex<()>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn SerialTransport>, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            wire: Mutex::new(()),
        }
    }

    /// The underlying transport (shared).
    pub fn transport(&self) -> Arc<dyn SerialTransport> {
        self.transport.clone()
    }

    /// Execute one AT command and classify its response.
    pub async fn execute(&self, cmd: &AtCommand) -> Result<CommandResponse, GsmError> {
        let _wire = self.wire.lock().await;
        self.exchange(cmd).await
    }

    /// Execute a prompt-terminated command, then inject `payload`
    /// followed by Ctrl+Z and read the final confirmation.
    ///
    /// The wire lock is held across the whole sequence: the prompt,
    /// the body bytes, and the (slow) final response belong to one
    /// exchange and nothing may interleave with them. The body is
    /// written directly on the transport since the modem's answer to
    /// it is a distinct, longer-latency response.
    pub async fn execute_with_payload(
        &self,
        cmd: &AtCommand,
        payload: &[u8],
        final_timeout_ms: u64,
    ) -> Result<CommandResponse, GsmError> {
        let _wire = self.wire.lock().await;

        let prompt = self.exchange(cmd).await?;
        if !prompt.outcome.is_ok() {
            return Ok(prompt);
        }

        let mut body = payload.to_vec();
        body.push(CTRL_Z);
        self.transport
            .write(&body)
            .await
            .map_err(GsmError::Transport)?;

        self.read_until_terminal(&cmd.text, false, final_timeout_ms)
            .await
    }

    async fn exchange(&self, cmd: &AtCommand) -> Result<CommandResponse, GsmError> {
        // Reset-before-write: bytes left over from a prior exchange
        // (late timeout responses, unsolicited codes) must not leak
        // into this command's response.
        self.transport
            .clear_input()
            .await
            .map_err(GsmError::Transport)?;

        let mut wire_cmd = cmd.text.clone().into_bytes();
        wire_cmd.push(b'\r');
        self.transport
            .write(&wire_cmd)
            .await
            .map_err(GsmError::Transport)?;

        self.read_until_terminal(&cmd.text, cmd.expect_prompt, cmd.timeout_ms)
            .await
    }

    /// Accumulate response lines until a terminal token, the `>`
    /// prompt (when expected), or the deadline.
    async fn read_until_terminal(
        &self,
        command_text: &str,
        expect_prompt: bool,
        timeout_ms: u64,
    ) -> Result<CommandResponse, GsmError> {
        let started = Instant::now();
        let deadline = TokioInstant::now() + Duration::from_millis(timeout_ms);
        let mut raw: Vec<u8> = Vec::new();
        let mut cursor = 0usize;
        let mut lines: Vec<String> = Vec::new();
        let mut buf = [0u8; 256];

        let outcome = 'read: loop {
            if TokioInstant::now() >= deadline {
                break CommandOutcome::Timeout;
            }
            // Each read is bounded by the transport's own blocking
            // window, so the deadline is enforced between reads. The
            // read future is awaited to completion: cancelling it
            // could strand transport state owned by the in-flight
            // call, and a timed-out command must leave the session
            // usable.
            let n = self
                .transport
                .read(&mut buf)
                .await
                .map_err(GsmError::Transport)?;
            if n == 0 {
                continue;
            }
            raw.extend_from_slice(&buf[..n]);

            // Consume complete lines.
            while let Some(pos) = raw[cursor..].iter().position(|&b| b == b'\n') {
                let end = cursor + pos;
                let line = String::from_utf8_lossy(&raw[cursor..end]).trim().to_string();
                cursor = end + 1;
                if line.is_empty() {
                    continue;
                }
                // Command echo is not content.
                if line.eq_ignore_ascii_case(command_text) {
                    continue;
                }
                if let Some(terminal) = self.classify(&line) {
                    break 'read terminal;
                }
                lines.push(line);
            }

            // The body-injection prompt arrives without a newline.
            if expect_prompt {
                let tail = String::from_utf8_lossy(&raw[cursor..]);
                if tail.trim_end().ends_with('>') {
                    break CommandOutcome::Ok;
                }
            }
        };

        let response = CommandResponse {
            command: command_text.to_string(),
            lines,
            outcome,
            raw_response: String::from_utf8_lossy(&raw).to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log::debug!(
            "{} -> {:?} in {}ms ({} line(s))",
            response.command,
            response.outcome,
            response.elapsed_ms,
            response.lines.len()
        );
        Ok(response)
    }

    /// Check whether a line is a terminal token.
    fn classify(&self, line: &str) -> Option<CommandOutcome> {
        if self
            .config
            .success_tokens
            .iter()
            .any(|t| line.eq_ignore_ascii_case(t))
        {
            return Some(CommandOutcome::Ok);
        }
        if self
            .config
            .failure_tokens
            .iter()
            .any(|t| line.eq_ignore_ascii_case(t))
        {
            return Some(CommandOutcome::Error(line.to_string()));
        }
        for prefix in &self.config.failure_prefixes {
            if let Some(code) = line.strip_prefix(prefix.as_str()) {
                return Some(CommandOutcome::Error(code.trim().to_string()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::transport::ScriptedModem;
    use crate::gsm::types::ModemConfig;

    async fn open_channel(modem: &Arc<ScriptedModem>) -> CommandChannel {
        modem
            .open(&ModemConfig::for_port("/dev/serial0"))
            .await
            .unwrap();
        CommandChannel::new(modem.clone(), ChannelConfig::default())
    }

    #[tokio::test]
    async fn test_execute_ok_with_data_lines() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem
            .rule("AT+CGMI", &["\r\nSIMCOM_Ltd\r\n\r\nOK\r\n"])
            .await;

        let resp = channel
            .execute(&AtCommand::new("AT+CGMI", 1000))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
        assert_eq!(resp.lines, vec!["SIMCOM_Ltd"]);
    }

    #[tokio::test]
    async fn test_execute_cms_error_code() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem.rule("AT+CMGD", &["\r\n+CMS ERROR: 321\r\n"]).await;

        let resp = channel
            .execute(&AtCommand::new("AT+CMGD=99", 1000))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Error("321".to_string()));
    }

    #[tokio::test]
    async fn test_execute_bare_error() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem.rule("AT+BOGUS", &["\r\nERROR\r\n"]).await;

        let resp = channel
            .execute(&AtCommand::new("AT+BOGUS", 1000))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Error("ERROR".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_then_next_command_unaffected() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem.rule("AT+CREG?", &[""]).await;

        let resp = channel
            .execute(&AtCommand::new("AT+CREG?", 200))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Timeout);

        // The answer arrives late, after the caller gave up.
        modem.inject_rx(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n").await;

        // The next, unrelated command must not see the leaked bytes.
        let resp = channel.execute(&AtCommand::new("AT", 1000)).await.unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
        assert!(resp.lines.is_empty());
        assert!(!resp.raw_response.contains("+CREG"));
    }

    #[tokio::test]
    async fn test_command_echo_is_filtered() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem.set_echo(true);
        modem
            .rule("AT+CSQ", &["\r\n+CSQ: 15,0\r\n\r\nOK\r\n"])
            .await;

        let resp = channel
            .execute(&AtCommand::new("AT+CSQ", 1000))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
        assert_eq!(resp.lines, vec!["+CSQ: 15,0"]);
    }

    #[tokio::test]
    async fn test_prompt_terminates_cmgs() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;

        let cmd = AtCommand::new("AT+CMGS=\"0041\"", 1000).expecting_prompt();
        let resp = channel.execute(&cmd).await.unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
        assert!(resp.raw_response.contains('>'));
    }

    #[tokio::test]
    async fn test_execute_with_payload_full_send() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;

        let cmd = AtCommand::new("AT+CMGS=\"0041\"", 1000).expecting_prompt();
        let resp = channel
            .execute_with_payload(&cmd, b"0048004500590021", 1000)
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
        assert!(resp.raw_response.contains("+CMGS:"));

        let frames = modem.frames().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], b"0048004500590021\x1A".to_vec());
    }

    #[tokio::test]
    async fn test_execute_with_payload_aborts_on_error_before_prompt() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        modem.rule("AT+CMGS", &["\r\n+CMS ERROR: 302\r\n"]).await;

        let cmd = AtCommand::new("AT+CMGS=\"0041\"", 1000).expecting_prompt();
        let resp = channel
            .execute_with_payload(&cmd, b"0048", 1000)
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Error("302".to_string()));

        // No body frame was written after the refusal.
        let frames = modem.frames().await;
        assert_eq!(frames.len(), 1);
    }

    /// Transport that parks a handle across its read await, the way a
    /// port-backed transport holds the boxed port. If a caller were
    /// cancelled mid-read the handle would be lost and every later
    /// call would fail as if the port were closed.
    struct HeldHandleTransport {
        inner: Arc<ScriptedModem>,
        slot: tokio::sync::Mutex<Option<()>>,
    }

    #[async_trait::async_trait]
    impl SerialTransport for HeldHandleTransport {
        async fn open(&self, config: &ModemConfig) -> Result<(), String> {
            self.inner.open(config).await?;
            *self.slot.lock().await = Some(());
            Ok(())
        }

        async fn close(&self) -> Result<(), String> {
            self.slot.lock().await.take();
            self.inner.close().await
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
            let handle = self.slot.lock().await.take().ok_or("Port not open")?;
            let n = self.inner.read(buf).await?;
            *self.slot.lock().await = Some(handle);
            Ok(n)
        }

        async fn write(&self, buf: &[u8]) -> Result<usize, String> {
            self.inner.write(buf).await
        }

        async fn clear_input(&self) -> Result<(), String> {
            self.inner.clear_input().await
        }

        async fn bytes_available(&self) -> Result<usize, String> {
            self.inner.bytes_available().await
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn port_name(&self) -> &str {
            self.inner.port_name()
        }
    }

    #[tokio::test]
    async fn test_timeout_does_not_strand_transport_state() {
        let modem = ScriptedModem::new("/dev/serial0");
        let transport = Arc::new(HeldHandleTransport {
            inner: modem.clone(),
            slot: tokio::sync::Mutex::new(None),
        });
        transport
            .open(&ModemConfig::for_port("/dev/serial0"))
            .await
            .unwrap();
        let channel = CommandChannel::new(transport, ChannelConfig::default());
        modem.rule("AT+CREG?", &[""]).await;

        let resp = channel
            .execute(&AtCommand::new("AT+CREG?", 200))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Timeout);

        // The handle survived the timeout; the session stays usable.
        let resp = channel.execute(&AtCommand::new("AT", 1000)).await.unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Ok);
    }

    #[tokio::test]
    async fn test_timeout_still_reports_collected_lines() {
        let modem = ScriptedModem::new("/dev/serial0");
        let channel = open_channel(&modem).await;
        // Informational line but never a terminal token.
        modem.rule("AT+CPIN?", &["\r\n+CPIN: READY\r\n"]).await;

        let resp = channel
            .execute(&AtCommand::new("AT+CPIN?", 200))
            .await
            .unwrap();
        assert_eq!(resp.outcome, CommandOutcome::Timeout);
        assert_eq!(resp.lines, vec!["+CPIN: READY"]);
    }
}
