//! Gateway facade.
//!
//! `SmsGateway` owns the whole stack for one modem: transport, command
//! channel, readiness flags, SMS client, and the optional receiver
//! task. Opening a gateway opens the port and runs the full boot
//! handshake; a handshake failure closes the port again so the caller
//! can retry from a clean state.

use crate::gsm::channel::CommandChannel;
use crate::gsm::init::InitSequencer;
use crate::gsm::receiver::{MessageSink, ReceiverLoop};
use crate::gsm::sms::SmsClient;
use crate::gsm::transport::{NativeTransport, SerialTransport};
use crate::gsm::types::{
    ChannelConfig, GsmError, ModemConfig, ModemInfo, ModemReadiness, ModemState, SendResult,
    SignalQuality, SmsMessage,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct SmsGateway {
    config: ModemConfig,
    transport: Arc<dyn SerialTransport>,
    client: Arc<SmsClient>,
    readiness: Arc<ModemReadiness>,
    opened_at: DateTime<Utc>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SmsGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmsGateway")
            .field("config", &self.config)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

impl SmsGateway {
    /// Open the transport and run the boot handshake to completion.
    pub async fn open(
        transport: Arc<dyn SerialTransport>,
        config: ModemConfig,
    ) -> Result<Self, GsmError> {
        transport.open(&config).await.map_err(GsmError::Transport)?;
        log::info!("Opened {} at {} baud", config.port_name, config.baud_rate);

        let channel = Arc::new(CommandChannel::new(
            transport.clone(),
            ChannelConfig::default(),
        ));
        let readiness = Arc::new(ModemReadiness::new());

        let init = InitSequencer::new(channel.clone(), readiness.clone(), config.clone());
        if let Err(e) = init.run().await {
            // Leave the port closed after a failed boot.
            let _ = transport.close().await;
            return Err(e);
        }

        let client = Arc::new(SmsClient::new(channel, readiness.clone(), config.clone()));
        Ok(Self {
            config,
            transport,
            client,
            readiness,
            opened_at: Utc::now(),
            receiver: Mutex::new(None),
        })
    }

    /// Open over a real serial port named in the configuration.
    pub async fn open_port(config: ModemConfig) -> Result<Self, GsmError> {
        let transport = NativeTransport::new(config.port_name.clone());
        Self::open(transport, config).await
    }

    // ── SMS operations ────────────────────────────────────────────

    pub async fn send(&self, phone: &str, message: &str) -> SendResult {
        self.client.send(phone, message).await
    }

    pub async fn list(&self, include_read: bool) -> Result<Vec<SmsMessage>, GsmError> {
        self.client.list(include_read).await
    }

    pub async fn delete_read(&self) -> Result<Vec<u32>, GsmError> {
        self.client.delete_read().await
    }

    pub async fn clear_all(&self) -> Result<(), GsmError> {
        self.client.clear_all().await
    }

    // ── Diagnostics ───────────────────────────────────────────────

    pub async fn signal_quality(&self) -> Result<SignalQuality, GsmError> {
        self.client.signal_quality().await
    }

    pub async fn modem_info(&self) -> Result<ModemInfo, GsmError> {
        self.client.modem_info().await
    }

    /// Snapshot of the initialization flags.
    pub fn readiness(&self) -> ModemState {
        self.readiness.snapshot()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn port_name(&self) -> &str {
        &self.config.port_name
    }

    // ── Receiver lifecycle ────────────────────────────────────────

    /// Start the polling receiver. Idempotent; a second call while a
    /// receiver is running is ignored with a warning.
    pub async fn start_receiver(&self, sink: Arc<dyn MessageSink>) {
        let mut guard = self.receiver.lock().await;
        if guard.is_some() {
            log::warn!("Receiver already running on {}", self.config.port_name);
            return;
        }
        let receiver = ReceiverLoop::new(self.client.clone(), sink, &self.config);
        *guard = Some(receiver.spawn());
    }

    /// Stop the polling receiver if one is running.
    pub async fn stop_receiver(&self) {
        if let Some(handle) = self.receiver.lock().await.take() {
            handle.abort();
            log::info!("Receiver stopped on {}", self.config.port_name);
        }
    }

    /// Stop the receiver and close the port.
    pub async fn close(&self) -> Result<(), GsmError> {
        self.stop_receiver().await;
        self.transport.close().await.map_err(GsmError::Transport)?;
        log::info!("Closed {}", self.config.port_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::channel::CTRL_Z;
    use crate::gsm::transport::ScriptedModem;
    use tokio::sync::Mutex as AsyncMutex;

    fn fast_config() -> ModemConfig {
        let mut cfg = ModemConfig::for_port("/dev/serial0");
        cfg.command_timeout_ms = 300;
        cfg.list_timeout_ms = 300;
        cfg.send_timeout_ms = 500;
        cfg.clear_timeout_ms = 300;
        cfg.init_retry_interval_ms = 20;
        cfg.init_deadline_ms = 3000;
        cfg.poll_interval_ms = 50;
        cfg
    }

    async fn bootable_modem() -> Arc<ScriptedModem> {
        let modem = ScriptedModem::new("/dev/serial0");
        modem
            .rule("AT+CPIN?", &["\r\n+CPIN: READY\r\n\r\nOK\r\n"])
            .await;
        modem
            .rule("AT+CREG?", &["\r\n+CREG: 0,1\r\n\r\nOK\r\n"])
            .await;
        modem
    }

    struct CollectingSink {
        received: AsyncMutex<Vec<SmsMessage>>,
    }

    #[async_trait::async_trait]
    impl MessageSink for CollectingSink {
        async fn deliver(&self, message: SmsMessage) -> Result<(), String> {
            self.received.lock().await.push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_runs_handshake_before_anything_else() {
        let modem = bootable_modem().await;
        let gateway = SmsGateway::open(modem.clone(), fast_config()).await.unwrap();

        assert!(gateway.readiness().is_fully_ready());
        let commands = modem.commands().await;
        assert_eq!(commands.first().map(String::as_str), Some("AT"));
        // No SMS traffic during boot.
        assert!(!commands.iter().any(|c| c.starts_with("AT+CMGL")));
        assert!(!commands.iter().any(|c| c.starts_with("AT+CMGS")));
    }

    #[tokio::test]
    async fn test_open_failure_closes_the_port() {
        let modem = ScriptedModem::new("/dev/serial0");
        modem
            .rule("AT+CPIN?", &["\r\n+CPIN: READY\r\n\r\nOK\r\n"])
            .await;
        modem
            .rule("AT+CREG?", &["\r\n+CREG: 0,2\r\n\r\nOK\r\n"])
            .await;
        let mut config = fast_config();
        config.init_deadline_ms = 400;

        let err = SmsGateway::open(modem.clone(), config).await.unwrap_err();
        assert!(matches!(err, GsmError::InitFailed(_)));
        assert!(!modem.is_open());
    }

    #[tokio::test]
    async fn test_send_and_list_through_the_gateway() {
        let modem = bootable_modem().await;
        modem
            .rule(
                "AT+CMGL",
                &["\r\n+CMGL: 1,\"REC UNREAD\",\"00410042\",,\"24/01/15,10:30:00+04\"\r\n0048004500590021\r\n\r\nOK\r\n"],
            )
            .await;
        let gateway = SmsGateway::open(modem.clone(), fast_config()).await.unwrap();

        let result = gateway.send("AB", "HEY!").await;
        assert!(result.success);

        let messages = gateway.list(false).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "HEY!");
    }

    #[tokio::test]
    async fn test_receiver_lifecycle_and_close() {
        let modem = bootable_modem().await;
        modem
            .rule(
                "AT+CMGL",
                &[
                    "\r\n+CMGL: 1,\"REC UNREAD\",\"00410042\",,\"24/01/15,10:30:00+04\"\r\n0048\r\n\r\nOK\r\n",
                    "\r\nOK\r\n",
                ],
            )
            .await;
        let gateway = SmsGateway::open(modem.clone(), fast_config()).await.unwrap();

        let sink = Arc::new(CollectingSink {
            received: AsyncMutex::new(Vec::new()),
        });
        gateway.start_receiver(sink.clone()).await;
        // Second start is a no-op.
        gateway.start_receiver(sink.clone()).await;

        tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;
        gateway.close().await.unwrap();

        assert_eq!(sink.received.lock().await.len(), 1);
        assert!(!modem.is_open());

        // Operations after close fold into failures, not panics.
        let result = gateway.send("AB", "late").await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_concurrent_send_and_list_never_interleave() {
        let modem = bootable_modem().await;
        modem.rule("AT+CMGL", &["\r\nOK\r\n"]).await;
        let gateway = Arc::new(
            SmsGateway::open(modem.clone(), fast_config()).await.unwrap(),
        );

        let g1 = gateway.clone();
        let g2 = gateway.clone();
        let (send_result, list_result) = tokio::join!(
            async move { g1.send("AB", "HEY!").await },
            async move { g2.list(true).await },
        );
        assert!(send_result.success);
        assert!(list_result.is_ok());

        // The body frame must directly follow its AT+CMGS header; any
        // frame in between would mean another command slipped inside
        // the send exchange.
        let frames = modem.frames().await;
        for (i, frame) in frames.iter().enumerate() {
            if frame.starts_with(b"AT+CMGS") {
                let next = frames.get(i + 1);
                assert_eq!(next.and_then(|f| f.last()), Some(&CTRL_Z));
            }
        }
    }
}
