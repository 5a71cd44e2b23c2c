//! Downstream RPC sink adapters: two persistent, auto-reconnecting,
//! fire-and-forget named-method clients (event, chat).
//!
//! The wire protocol of the RPC framework itself is swappable, so the
//! orchestrator depends only on the `EventSink`/`ChatSink` traits below.
//! `TcpJsonRpcSink` is the concrete, working default: a minimal
//! length-prefixed JSON-over-TCP client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::event::Event;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn process_event(&self, event: Event);
    fn is_connected(&self) -> bool;
    /// Tears down the connection and stops redialing. Called once, at
    /// process shutdown.
    async fn close(&self);
}

#[async_trait::async_trait]
pub trait ChatSink: Send + Sync {
    async fn twitch_chatter(&self, raw: String);
    async fn im_here(&self, alive: bool);
    fn is_connected(&self) -> bool;
    /// Tears down the connection and stops redialing. Called once, at
    /// process shutdown.
    async fn close(&self);
}

#[derive(Serialize)]
struct RpcCall<'a, T> {
    method: &'a str,
    params: T,
}

/// A fire-and-forget, length-prefixed JSON-over-TCP client that redials
/// forever on disconnect. One instance serves exactly one named-method
/// role (event sink or chat sink); construct two for the two roles.
pub struct TcpJsonRpcSink {
    addr: String,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TcpJsonRpcSink {
    /// Leaks a new sink and spawns its reconnect-forever loop. Sinks are
    /// process-lifetime singletons, same as the orchestrator they feed.
    pub fn spawn(addr: String) -> &'static Self {
        let sink: &'static Self = Box::leak(Box::new(TcpJsonRpcSink {
            addr,
            write_half: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }));
        tokio::spawn(sink.run_reconnect_loop());
        sink
    }

    async fn run_reconnect_loop(&'static self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "rpc sink connected");
                    let (mut read_half, write_half) = stream.into_split();
                    *self.write_half.lock().await = Some(write_half);
                    self.connected.store(true, Ordering::SeqCst);

                    // Fire-and-forget: we never expect inbound data. Keep
                    // reading until the peer closes or errors, purely to
                    // detect disconnect.
                    let mut probe = [0u8; 64];
                    loop {
                        match read_half.read(&mut probe).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        }
                    }
                }
                Err(e) => warn!(addr = %self.addr, error = %e, "rpc sink connect failed"),
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.write_half.lock().await = None;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shuts down the current socket (if any) and stops redialing; the
    /// reconnect loop observes `closed` and exits instead of sleeping and
    /// retrying.
    async fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut w) = self.write_half.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }

    async fn send_call<T: Serialize + Send>(&self, method: &str, params: T) {
        if !self.connected() {
            return;
        }

        let payload = match serde_json::to_vec(&RpcCall { method, params }) {
            Ok(p) => p,
            Err(e) => {
                warn!(method, error = %e, "failed to encode rpc call");
                return;
            }
        };

        let mut guard = self.write_half.lock().await;
        if let Some(w) = guard.as_mut() {
            let len_prefix = (payload.len() as u32).to_be_bytes();
            let failed = w.write_all(&len_prefix).await.is_err() || w.write_all(&payload).await.is_err();
            if failed {
                drop(guard);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    #[cfg(test)]
    fn new_for_test() -> Self {
        TcpJsonRpcSink {
            addr: String::new(),
            write_half: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for TcpJsonRpcSink {
    async fn process_event(&self, event: Event) {
        self.send_call("process-event", event).await;
    }

    fn is_connected(&self) -> bool {
        self.connected()
    }

    async fn close(&self) {
        self.teardown().await;
    }
}

#[async_trait::async_trait]
impl ChatSink for TcpJsonRpcSink {
    async fn twitch_chatter(&self, raw: String) {
        self.send_call("twitch-chatter", raw).await;
    }

    async fn im_here(&self, alive: bool) {
        self.send_call("im-here", alive).await;
    }

    fn is_connected(&self) -> bool {
        self.connected()
    }

    async fn close(&self) {
        self.teardown().await;
    }
}

// `spawn` hands callers a leaked `&'static TcpJsonRpcSink` (the sink's own
// reconnect loop needs that lifetime), but the orchestrator stores sinks as
// `Box<dyn EventSink>`/`Box<dyn ChatSink>`. These forwarding impls let a
// `Box::new(sink)` of the reference itself satisfy those trait objects
// without giving every call site its own deref boilerplate.
#[async_trait::async_trait]
impl EventSink for &'static TcpJsonRpcSink {
    async fn process_event(&self, event: Event) {
        (**self).process_event(event).await;
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

#[async_trait::async_trait]
impl ChatSink for &'static TcpJsonRpcSink {
    async fn twitch_chatter(&self, raw: String) {
        (**self).twitch_chatter(raw).await;
    }

    async fn im_here(&self, alive: bool) {
        (**self).im_here(alive).await;
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&self) {
        (**self).close().await;
    }
}
