use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::{Reader, Writer};

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// Serializes half-duplex bus access and survives being handed between
// executor contexts (a polling loop and an API server running as separate
// tokio tasks, say). Rather than probing "which runtime am I on" at the
// tokio level, callers mint an `ExecutorContext` once per task and pass it
// in; the session compares handles and force-recreates the client whenever
// they differ. This is the explicit-handle design called for over the
// source tool's runtime introspection trick.
// --------------------------------------------------------------------------------------------------------------

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorContext(u64);

impl ExecutorContext {
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ExecutorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates (or recreates) the underlying transport. One impl per transport
/// kind (RTU over a serial device, TCP to a gateway).
#[async_trait]
pub trait ModbusConnector: Send + Sync {
    async fn connect(&self) -> DeviceResult<ModbusContext>;

    /// Cheap existence probe used by the happy-path `ensure_connected` check.
    /// Serial connectors should stat the device file; TCP connectors have
    /// nothing to check locally and return `true`.
    fn port_exists(&self) -> bool {
        true
    }
}

struct SessionState {
    client: Option<ModbusContext>,
    bound: Option<ExecutorContext>,
}

pub struct ModbusSession {
    connector: Arc<dyn ModbusConnector>,
    state: AsyncMutex<SessionState>,
    recreate_guard: AsyncMutex<()>,
    /// Addresses >= this threshold must use function 16 (write multiple) even
    /// for a single word - required by one vendor's firmware. `None` means
    /// always use the natural function (6 for one word, 16 for several).
    pub force_multi_write_from: Option<u16>,
}

fn is_fail_fast(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("port not found") || m.contains("no such device")
}

fn is_port_locked(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("port locked") || msg.to_ascii_lowercase().contains("resource busy")
}

impl ModbusSession {
    pub fn new(connector: Arc<dyn ModbusConnector>) -> Self {
        Self {
            connector,
            state: AsyncMutex::new(SessionState { client: None, bound: None }),
            recreate_guard: AsyncMutex::new(()),
            force_multi_write_from: None,
        }
    }

    pub fn with_multi_write_threshold(mut self, addr: u16) -> Self {
        self.force_multi_write_from = Some(addr);
        self
    }

    /// Closes the underlying transport (best-effort), drops the reference,
    /// and waits for the OS to release the port before any recreate attempt.
    async fn force_close(&self) {
        let mut state = self.state.lock().await;
        if state.client.take().is_some() {
            log::debug!("modbus session: force-closed client");
        }
        drop(state);
        sleep(Duration::from_millis(700)).await;
    }

    async fn connect_with_retry(&self) -> DeviceResult<ModbusContext> {
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(ctx) => return Ok(ctx),
                Err(e) => {
                    let msg = e.to_string();
                    if is_fail_fast(&msg) {
                        log::warn!("modbus connect failed fast (no retry): {msg}");
                        return Err(e);
                    }
                    if attempt >= 3 {
                        log::warn!("modbus connect failed after {attempt} attempts: {msg}");
                        return Err(e);
                    }
                    let wait = if is_port_locked(&msg) { delay * 3 } else { delay };
                    log::warn!("modbus connect attempt {attempt} failed ({msg}), retrying in {wait:?}");
                    sleep(wait).await;
                    delay *= 2;
                }
            }
        }
    }

    /// Idempotent and cheap on the happy path: if already connected in the
    /// given context and the port still exists, returns immediately without
    /// touching the recreate guard.
    pub async fn ensure_connected(&self, ctx: ExecutorContext) -> DeviceResult<()> {
        {
            let state = self.state.lock().await;
            if state.client.is_some() && state.bound == Some(ctx) && self.connector.port_exists() {
                return Ok(());
            }
        }

        let _guard = self.recreate_guard.lock().await;
        // Re-check under the guard - another task may have already recreated.
        {
            let state = self.state.lock().await;
            if state.client.is_some() && state.bound == Some(ctx) && self.connector.port_exists() {
                return Ok(());
            }
        }

        let migrating = {
            let state = self.state.lock().await;
            state.client.is_some() && state.bound != Some(ctx)
        };
        if migrating {
            log::info!("modbus session: executor context changed, force-closing before recreate");
        }
        self.force_close().await;

        let new_client = self
            .connect_with_retry()
            .await
            .map_err(|e| DeviceError::TransportUnavailable(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.client = Some(new_client);
        state.bound = Some(ctx);
        Ok(())
    }

    /// tokio-modbus's `Reader`/`Writer` methods return the wire-level result
    /// nested inside the transport-level one: `Ok(Ok(v))` is success, `Ok(Err(exc))`
    /// is a Modbus exception response (treated as a protocol error, not a
    /// transport failure - the bus is fine, the device rejected the PDU), and
    /// `Err(io)` is the transport failing outright (force-close territory).
    async fn with_client<F, T>(&self, ctx: ExecutorContext, op: F) -> DeviceResult<T>
    where
        F: for<'a> FnOnce(
            &'a mut ModbusContext,
        ) -> futures::future::BoxFuture<
            'a,
            Result<Result<T, tokio_modbus::ExceptionCode>, std::io::Error>,
        >,
    {
        self.ensure_connected(ctx).await?;
        let mut state = self.state.lock().await;
        let client = state
            .client
            .as_mut()
            .ok_or_else(|| DeviceError::TransportUnavailable("modbus client missing after connect".to_string()))?;
        match op(client).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(exc)) => Err(DeviceError::ProtocolError(format!("modbus exception: {exc}"))),
            Err(e) => {
                let msg = e.to_string();
                drop(state);
                self.force_close().await;
                Err(DeviceError::TransportUnavailable(msg))
            }
        }
    }

    pub async fn read_holding_registers(&self, ctx: ExecutorContext, addr: u16, count: u16) -> DeviceResult<Vec<u16>> {
        self.with_client(ctx, move |c| Box::pin(async move { c.read_holding_registers(addr, count).await }))
            .await
    }

    pub async fn read_input_registers(&self, ctx: ExecutorContext, addr: u16, count: u16) -> DeviceResult<Vec<u16>> {
        self.with_client(ctx, move |c| Box::pin(async move { c.read_input_registers(addr, count).await }))
            .await
    }

    /// Writes `words` starting at `addr`, picking function 6 (single write)
    /// vs function 16 (write multiple) per `force_multi_write_from` and word count.
    pub async fn write_registers(&self, ctx: ExecutorContext, addr: u16, words: &[u16]) -> DeviceResult<()> {
        let force_multi = self.force_multi_write_from.map(|t| addr >= t).unwrap_or(false);
        if words.len() == 1 && !force_multi {
            let word = words[0];
            self.with_client(ctx, move |c| Box::pin(async move { c.write_single_register(addr, word).await }))
                .await
        } else {
            let words = words.to_vec();
            self.with_client(ctx, move |c| {
                Box::pin(async move { c.write_multiple_registers(addr, &words).await })
            })
            .await
        }
    }
}

/// Binds a `ModbusSession` plus the caller's `ExecutorContext` into the
/// generic `RegisterTransport` seam the register engine talks to.
pub struct ModbusRegisterTransport {
    pub session: Arc<ModbusSession>,
    pub ctx: ExecutorContext,
}

#[async_trait]
impl crate::registers::RegisterTransport for ModbusRegisterTransport {
    async fn read_words(&self, kind: crate::registers::RegisterKind, addr: u16, count: u16) -> DeviceResult<Vec<u16>> {
        match kind {
            crate::registers::RegisterKind::Holding => self.session.read_holding_registers(self.ctx, addr, count).await,
            crate::registers::RegisterKind::Input => self.session.read_input_registers(self.ctx, addr, count).await,
        }
    }

    async fn write_words(&self, addr: u16, words: &[u16]) -> DeviceResult<()> {
        self.session.write_registers(self.ctx, addr, words).await
    }
}
