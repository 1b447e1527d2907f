//! Mercury integration test harness.
//!
//! Each test binds two real `NetworkInterface`s on loopback UDP and talks
//! between them; no sockets are mocked. Interfaces get OS-assigned ports,
//! so tests are independent and can run in parallel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use mercury_core::bundle::{Payload, UnpackedMessageHeader};
use mercury_core::interface::{InterfaceElement, InterfaceTable, LengthStyle};
use mercury_core::packet::ReplyId;
use mercury_core::reason::{MessageHandler, Reason, ReplyMessageHandler};
use mercury_net::{MercuryConfig, NetworkInterface};

mod fragments;
mod messaging;

// ── Shared message vocabulary ─────────────────────────────────────────────────

pub const ECHO: InterfaceElement = InterfaceElement::new("echo", 1, LengthStyle::Variable, 2);
pub const BULK: InterfaceElement = InterfaceElement::new("bulk", 2, LengthStyle::Variable, 2);

// ── Harness ───────────────────────────────────────────────────────────────────

/// Bind an interface on loopback with the given table and start its
/// background tasks.
pub async fn bind_interface(table: InterfaceTable) -> Result<Arc<NetworkInterface>> {
    let mut config = MercuryConfig::default();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    bind_with(config, table).await
}

/// As `bind_interface`, but with a caller-supplied config.
pub async fn bind_with(
    config: MercuryConfig,
    table: InterfaceTable,
) -> Result<Arc<NetworkInterface>> {
    init_tracing();
    let iface = NetworkInterface::bind(config, table).await?;
    iface.start();
    Ok(iface)
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

/// Poll `f` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !f() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Collects every payload dispatched to it.
#[derive(Default)]
pub struct Collector {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl Collector {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageHandler for Collector {
    fn handle_message(
        &self,
        _source: SocketAddr,
        _header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    ) -> Result<(), Reason> {
        self.seen.lock().unwrap().push(payload.get_rest().to_vec());
        Ok(())
    }
}

/// Forwards requests out of the dispatch context so a test task can build
/// and send the reply (handlers are synchronous; sending is not).
pub struct RequestSink {
    tx: mpsc::UnboundedSender<(SocketAddr, ReplyId, Vec<u8>)>,
}

impl RequestSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SocketAddr, ReplyId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestSink { tx }, rx)
    }
}

impl MessageHandler for RequestSink {
    fn handle_message(
        &self,
        source: SocketAddr,
        header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    ) -> Result<(), Reason> {
        let _ = self
            .tx
            .send((source, header.reply_id, payload.get_rest().to_vec()));
        Ok(())
    }
}

/// Resolves a oneshot-style channel with the reply payload or the failure
/// reason.
pub struct ReplyWaiter {
    tx: mpsc::UnboundedSender<Result<Vec<u8>, Reason>>,
}

impl ReplyWaiter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Result<Vec<u8>, Reason>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ReplyWaiter { tx }), rx)
    }
}

impl ReplyMessageHandler for ReplyWaiter {
    fn handle_reply(
        &self,
        _source: SocketAddr,
        _header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    ) {
        let _ = self.tx.send(Ok(payload.get_rest().to_vec()));
    }

    fn handle_exception(&self, reason: Reason) {
        let _ = self.tx.send(Err(reason));
    }
}
