//! Cold-start initialization sequencer.
//!
//! Walks the modem through its boot handshake in a fixed order:
//!
//! - probe with `AT` until the firmware answers
//! - wait for the SIM (`AT+CPIN?` must report `READY`)
//! - wait for network registration (`AT+CREG?` home or roaming)
//! - configure text mode, UCS2 charset, and SIM message storage
//!
//! Each stage retries at a fixed interval under one overall deadline.
//! Readiness flags advance monotonically as stages complete, so other
//! tasks can observe partial progress; SMS operations are gated on the
//! full set.

use crate::gsm::channel::CommandChannel;
use crate::gsm::types::{AtCommand, CommandResponse, GsmError, ModemConfig, ModemReadiness};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// The three mode commands, applied all-or-nothing in one pass.
const MODE_COMMANDS: [&str; 3] = [
    "AT+CMGF=1",
    "AT+CSCS=\"UCS2\"",
    "AT+CPMS=\"SM_P\",\"SM_P\",\"SM_P\"",
];

/// Drives the boot handshake and publishes readiness flags.
pub struct InitSequencer {
    channel: Arc<CommandChannel>,
    readiness: Arc<ModemReadiness>,
    config: ModemConfig,
}

impl InitSequencer {
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

    /// Run the full handshake. Returns once the modem is fully ready
    /// or fails with `InitFailed` when the deadline is missed.
    pub async fn run(&self) -> Result<(), GsmError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.init_deadline_ms);
        let probe = AtCommand::new("AT", self.config.command_timeout_ms);

        self.retry_until(deadline, "probe", &probe, |r| r.outcome.is_ok())
            .await?;
        self.readiness.set_responsive();
        log::info!(
            "Modem responsive on {}",
            self.channel.transport().port_name()
        );

        // Echo off keeps responses clean. The channel filters echo
        // anyway, so a refusal is only worth a warning.
        let ate0 = self
            .channel
            .execute(&AtCommand::new("ATE0", self.config.command_timeout_ms))
            .await?;
        if !ate0.outcome.is_ok() {
            log::warn!("ATE0 not accepted: {:?}", ate0.outcome);
        }

        let cpin = AtCommand::new("AT+CPIN?", self.config.command_timeout_ms);
        self.retry_until(deadline, "SIM readiness", &cpin, |r| {
            r.contains("+CPIN: READY")
        })
        .await?;
        self.readiness.set_sim_ready();
        log::info!("SIM ready");

        let creg = AtCommand::new("AT+CREG?", self.config.command_timeout_ms);
        self.retry_until(deadline, "network registration", &creg, |r| {
            // 0,1 = registered home, 0,5 = registered roaming.
            r.contains("0,1") || r.contains("0,5")
        })
        .await?;
        self.readiness.set_registered();
        log::info!("Network registered");

        // A partial pass leaves the modem in a mixed configuration,
        // so the whole triple restarts after a failed member.
        loop {
            if self.configure_modes().await? {
                break;
            }
            self.pause_or_fail(deadline, "mode configuration").await?;
        }
        self.readiness.set_mode_configured();
        log::info!("Modem initialization complete");
        Ok(())
    }

    /// Repeat `cmd` until `accept` passes, pausing between attempts.
    async fn retry_until(
        &self,
        deadline: Instant,
        step: &str,
        cmd: &AtCommand,
        accept: impl Fn(&CommandResponse) -> bool,
    ) -> Result<(), GsmError> {
        loop {
            let resp = self.channel.execute(cmd).await?;
            if accept(&resp) {
                return Ok(());
            }
            log::debug!("init {}: {:?}, retrying", step, resp.outcome);
            self.pause_or_fail(deadline, step).await?;
        }
    }

    async fn pause_or_fail(&self, deadline: Instant, step: &str) -> Result<(), GsmError> {
        let wait = Duration::from_millis(self.config.init_retry_interval_ms);
        if Instant::now() + wait >= deadline {
            return Err(GsmError::InitFailed(format!(
                "deadline reached during {}",
                step
            )));
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// One pass over the mode triple. `Ok(false)` means a member was
    /// rejected and the pass must be repeated from the start.
    async fn configure_modes(&self) -> Result<bool, GsmError> {
        for text in MODE_COMMANDS {
            let resp = self
                .channel
                .execute(&AtCommand::new(text, self.config.command_timeout_ms))
                .await?;
            if !resp.outcome.is_ok() {
                log::warn!("{} rejected during init: {:?}", text, resp.outcome);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
