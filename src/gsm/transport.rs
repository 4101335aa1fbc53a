//! Serial port transport abstraction.
//!
//! Provides a platform-agnostic wrapper around byte-level serial I/O.
//! The native back-end drives a real port through the `serialport`
//! crate (blocking calls shuttled through `spawn_blocking`); the
//! simulated and scripted transports keep everything in memory so the
//! protocol engine can be exercised without hardware.

use crate::gsm::types::ModemConfig;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and shared between the command channel and the receiver task.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open the port with the given configuration.
    async fn open(&self, config: &ModemConfig) -> Result<(), String>;

    /// Close the port.
    async fn close(&self) -> Result<(), String>;

    /// Read up to `buf.len()` bytes into `buf`. Returns the number of
    /// bytes read; 0 means nothing arrived within the port's blocking
    /// read window.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, String>;

    /// Write all bytes in `buf`.
    async fn write(&self, buf: &[u8]) -> Result<usize, String>;

    /// Discard any bytes buffered in the receive direction. The
    /// channel calls this before every command so one exchange cannot
    /// leak into the next.
    async fn clear_input(&self) -> Result<(), String>;

    /// Number of bytes waiting in the receive buffer.
    async fn bytes_available(&self) -> Result<usize, String>;

    /// Check whether the port is open.
    fn is_open(&self) -> bool;

    /// Retrieve the port name.
    fn port_name(&self) -> &str;
}

/// Enumerate serial ports visible to the OS.
pub fn list_ports() -> Result<Vec<String>, String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Native transport (serialport crate)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PortSlot = Arc<StdMutex<Option<Box<dyn serialport::SerialPort>>>>;

fn lock_slot(slot: &PortSlot) -> std::sync::MutexGuard<'_, Option<Box<dyn serialport::SerialPort>>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Real serial port backed by the `serialport` crate.
///
/// Blocking port calls run on `spawn_blocking`. The boxed port lives
/// in a plain mutex slot; each call takes it out and the same blocking
/// task puts it back, so a caller cancelled mid-await (command
/// deadline, task abort) can never drop the port. A slot found empty
/// while the port is open means a call is in flight and is waited
/// for, not treated as closed.
pub struct NativeTransport {
    name: String,
    open: Arc<AtomicBool>,
    port: PortSlot,
}

impl NativeTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: Arc::new(AtomicBool::new(false)),
            port: Arc::new(StdMutex::new(None)),
        })
    }

    #[cfg(test)]
    fn with_injected_port(
        port_name: impl Into<String>,
        port: Box<dyn serialport::SerialPort>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: Arc::new(AtomicBool::new(true)),
            port: Arc::new(StdMutex::new(Some(port))),
        })
    }

    /// Take the port out of the slot, waiting out an in-flight call.
    async fn take_port(&self) -> Result<Box<dyn serialport::SerialPort>, String> {
        let deadline =
            tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return Err("Port not open".to_string());
            }
            if let Some(port) = lock_slot(&self.port).take() {
                return Ok(port);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("Port {} busy", self.name));
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }
    }

    /// Run `f` on the port inside a blocking task. That task also
    /// restores the port, so cancelling the awaiting future leaves the
    /// restore intact and the next call finds the port in the slot.
    async fn with_port<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Box<dyn serialport::SerialPort>) -> Result<T, String> + Send + 'static,
    ) -> Result<T, String> {
        let mut port = self.take_port().await?;
        let slot = self.port.clone();
        let open = self.open.clone();
        tokio::task::spawn_blocking(move || {
            let result = f(&mut port);
            // Restore unless the transport was closed meanwhile.
            if open.load(Ordering::SeqCst) {
                *lock_slot(&slot) = Some(port);
            }
            result
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[async_trait::async_trait]
impl SerialTransport for NativeTransport {
    async fn open(&self, config: &ModemConfig) -> Result<(), String> {
        if self.open.load(Ordering::SeqCst) {
            return Err(format!("Port {} already open", self.name));
        }
        let name = self.name.clone();
        let baud = config.baud_rate;
        let read_window = std::time::Duration::from_millis(config.read_timeout_ms.max(10));
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud).timeout(read_window).open()
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

        *lock_slot(&self.port) = Some(port);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the handle closes the descriptor. An in-flight call
        // holding the port sees the closed flag and drops it instead
        // of restoring.
        lock_slot(&self.port).take();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
        let cap = buf.len();
        let data = self
            .with_port(move |port| {
                let mut tmp = vec![0u8; cap];
                match port.read(&mut tmp) {
                    Ok(n) => {
                        tmp.truncate(n);
                        Ok(tmp)
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, String> {
        let data = buf.to_vec();
        self.with_port(move |port| {
            port.write_all(&data)
                .and_then(|_| port.flush())
                .map_err(|e| e.to_string())
        })
        .await?;
        Ok(buf.len())
    }

    async fn clear_input(&self) -> Result<(), String> {
        self.with_port(|port| {
            port.clear(serialport::ClearBuffer::Input)
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn bytes_available(&self) -> Result<usize, String> {
        self.with_port(|port| {
            port.bytes_to_read()
                .map(|n| n as usize)
                .map_err(|e| e.to_string())
        })
        .await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport useful for unit tests.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port name.
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
        })
    }

    /// Inject bytes into the receive buffer (simulate modem output).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, _config: &ModemConfig) -> Result<(), String> {
        if self.open.load(Ordering::SeqCst) {
            return Err(format!("Port {} already open", self.name));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            // Wait for data with a short cap so callers can poll.
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(50)) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for b in buf.iter_mut().take(count) {
            *b = rx.pop_front().unwrap();
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let mut tx = self.tx_buf.lock().await;
        tx.extend(buf);
        Ok(buf.len())
    }

    async fn clear_input(&self) -> Result<(), String> {
        self.rx_buf.lock().await.clear();
        Ok(())
    }

    async fn bytes_available(&self) -> Result<usize, String> {
        Ok(self.rx_buf.lock().await.len())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Scripted modem (protocol-level test double)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScriptRule {
    prefix: String,
    /// Replies consumed front-to-back; the last one repeats. An empty
    /// reply means "stay silent" (provokes a timeout).
    replies: VecDeque<String>,
}

/// In-memory transport that answers like a SIM800-class modem.
///
/// Every `write` call is recorded as one wire frame; a frame ending in
/// `\r` is interpreted as an AT command and answered from the script
/// (default reply `OK`), a frame ending in Ctrl+Z is treated as an SMS
/// body and answered with the configured send reply. Command echo can
/// be toggled and reacts to `ATE0` like real firmware.
pub struct ScriptedModem {
    name: String,
    open: AtomicBool,
    rx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
    frames: Mutex<Vec<Vec<u8>>>,
    rules: Mutex<Vec<ScriptRule>>,
    echo: AtomicBool,
    awaiting_body: AtomicBool,
    send_reply: Mutex<String>,
}

impl ScriptedModem {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
            frames: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            echo: AtomicBool::new(false),
            awaiting_body: AtomicBool::new(false),
            send_reply: Mutex::new("\r\n+CMGS: 1\r\n\r\nOK\r\n".to_string()),
        })
    }

    /// Script replies for commands starting with `prefix`. The most
    /// specific (longest) matching prefix answers, so a broad `"AT"`
    /// rule cannot shadow `"AT+CPIN?"` regardless of registration
    /// order. Replies are consumed in order; the final one repeats on
    /// later attempts.
    pub async fn rule(&self, prefix: &str, replies: &[&str]) {
        self.rules.lock().await.push(ScriptRule {
            prefix: prefix.to_string(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
        });
    }

    /// Enable command echo (as a modem with `ATE1` would).
    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::SeqCst);
    }

    /// Override the reply to an SMS body frame.
    pub async fn set_send_reply(&self, reply: &str) {
        *self.send_reply.lock().await = reply.to_string();
    }

    /// Inject raw bytes into the receive buffer (e.g. stale garbage).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// All wire frames written so far, one per `write` call.
    pub async fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().await.clone()
    }

    /// Decoded command frames (those terminated by `\r`), in order.
    pub async fn commands(&self) -> Vec<String> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|f| f.last() == Some(&b'\r'))
            .map(|f| String::from_utf8_lossy(f).trim().to_string())
            .collect()
    }

    async fn reply_with(&self, reply: &str) {
        if reply.is_empty() {
            return;
        }
        let mut rx = self.rx_buf.lock().await;
        rx.extend(reply.as_bytes());
        self.rx_notify.notify_waiters();
    }

    async fn answer_command(&self, cmd: &str) {
        if self.echo.load(Ordering::SeqCst) {
            self.reply_with(&format!("{}\r\n", cmd)).await;
        }
        if cmd == "ATE0" {
            self.echo.store(false, Ordering::SeqCst);
        }

        let reply = {
            let mut rules = self.rules.lock().await;
            match rules
                .iter_mut()
                .filter(|r| cmd.starts_with(&r.prefix))
                .max_by_key(|r| r.prefix.len())
            {
                Some(rule) => {
                    if rule.replies.len() > 1 {
                        rule.replies.pop_front()
                    } else {
                        rule.replies.front().cloned()
                    }
                }
                None => None,
            }
        };

        let reply = match reply {
            Some(r) => r,
            // Unscripted commands: prompt for CMGS, OK for the rest.
            None if cmd.starts_with("AT+CMGS") => "\r\n> ".to_string(),
            None => "\r\nOK\r\n".to_string(),
        };

        if reply.trim_end().ends_with('>') {
            self.awaiting_body.store(true, Ordering::SeqCst);
        }
        self.reply_with(&reply).await;
    }
}

#[async_trait::async_trait]
impl SerialTransport for ScriptedModem {
    async fn open(&self, _config: &ModemConfig) -> Result<(), String> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(50)) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for b in buf.iter_mut().take(count) {
            *b = rx.pop_front().unwrap();
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("Port not open".to_string());
        }
        self.frames.lock().await.push(buf.to_vec());

        if self.awaiting_body.load(Ordering::SeqCst) && buf.last() == Some(&0x1A) {
            self.awaiting_body.store(false, Ordering::SeqCst);
            let reply = self.send_reply.lock().await.clone();
            self.reply_with(&reply).await;
        } else if buf.last() == Some(&b'\r') {
            let cmd = String::from_utf8_lossy(buf).trim().to_string();
            self.answer_command(&cmd).await;
        }
        Ok(buf.len())
    }

    async fn clear_input(&self) -> Result<(), String> {
        self.rx_buf.lock().await.clear();
        Ok(())
    }

    async fn bytes_available(&self) -> Result<usize, String> {
        Ok(self.rx_buf.lock().await.len())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}
