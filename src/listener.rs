//! One anonymous TLS connection to Twitch IRC: its paced JOIN drip-feed,
//! its receive loop, and the reconnect state machine.
//!
//! ```text
//! created --Listen()--> connecting --001--> joining --error--> disconnected
//!                                          ^                       |
//!                                          +----- re-Listen() -----+
//! ```
//! `joining` isn't tracked as a distinct state from `listening`: once past
//! `001` a listener just paces JOINs indefinitely until the connection ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::event::{self, IdentitySlim};
use crate::orchestrator::Orchestrator;
use crate::parser;
use crate::queue::BoundedQueue;

const TWITCH_IRC_HOST: &str = "irc.chat.twitch.tv";
const TWITCH_IRC_PORT: u16 = 443;
const JOIN_PACE: Duration = Duration::from_millis(50);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_LINE_LENGTH: usize = 8192;

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;
type IrcFramed = Framed<TlsStream, LinesCodec>;
type IrcSink = SplitSink<IrcFramed, String>;

/// A fresh anonymous `justinfan<1000-9999>` nick. Callers that need
/// uniqueness against an existing pool re-roll until it's not already used.
pub fn random_nick() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("justinfan{suffix}")
}

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    #[error("tcp connect to {0} failed: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),
}

/// One IRC connection plus the channels it has joined or is about to join.
pub struct Listener {
    pub username: String,
    listening: AtomicBool,
    disconnected: AtomicBool,
    retry_later: AtomicBool,
    channels: Mutex<HashMap<String, IdentitySlim>>,
    channel_buffer: BoundedQueue<IdentitySlim>,
    write_half: Mutex<Option<IrcSink>>,
    orchestrator: &'static Orchestrator,
    closer: CancellationToken,
}

impl Listener {
    pub fn new(
        username: String,
        orchestrator: &'static Orchestrator,
        closer: CancellationToken,
        channel_buffer_capacity: usize,
    ) -> Self {
        Listener {
            username,
            listening: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            retry_later: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            channel_buffer: BoundedQueue::new(channel_buffer_capacity),
            write_half: Mutex::new(None),
            orchestrator,
            closer,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.channel_buffer.len()
    }

    pub async fn has_channel(&self, login: &str) -> bool {
        self.channels.lock().await.contains_key(login)
    }

    /// Enqueues `identity` to be JOINed by the pacer. Returns `false` if the
    /// buffer is already full (caller is responsible for the
    /// `channelsPerListener` admission check before calling this).
    pub async fn enqueue_channel(&self, identity: IdentitySlim) -> bool {
        self.channel_buffer.push(identity).await
    }

    /// Removes `login` from the joined set and sends `PART`. A no-op,
    /// connection-wise, if the listener currently has no write half (not
    /// connected yet); the removal from `channels` still happens so the
    /// sharding bookkeeping stays correct.
    pub async fn part(&self, login: &str) {
        self.channels.lock().await.remove(login);
        self.send_line(format!("PART #{login}")).await;
    }

    pub async fn quit(&self) {
        self.send_line("QUIT".to_owned()).await;
    }

    async fn send_line(&self, line: String) {
        let mut guard = self.write_half.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.send(line).await {
                warn!(listener = %self.username, error = %e, "failed to write line");
            }
        }
    }

    /// Dials Twitch and runs the connection until it ends, then either
    /// reconnects (transient error) or triggers the shared process closer
    /// (an "Error logging in" NOTICE, which is unrecoverable for an
    /// anonymous connection) and returns for good.
    pub async fn listen(&'static self) {
        self.listening.store(true, Ordering::Release);
        loop {
            info!(listener = %self.username, "dialing twitch irc");
            if let Err(e) = self.run_connection().await {
                warn!(listener = %self.username, error = %e, "irc connection error");
            }

            self.disconnected.store(true, Ordering::Release);
            *self.write_half.lock().await = None;

            if self.retry_later.swap(false, Ordering::AcqRel) {
                tokio::time::sleep(RETRY_DELAY).await;
                warn!(listener = %self.username, "login failed; triggering process closer");
                self.closer.cancel();
                return;
            }
        }
    }

    async fn dial() -> Result<TlsStream, ListenerError> {
        let addr = format!("{TWITCH_IRC_HOST}:{TWITCH_IRC_PORT}");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ListenerError::Connect(addr, e))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(std::sync::Arc::new(tls_config));
        let domain = rustls::ServerName::try_from(TWITCH_IRC_HOST)
            .expect("static hostname is a valid DNS name");

        connector.connect(domain, tcp).await.map_err(ListenerError::Tls)
    }

    async fn run_connection(&'static self) -> Result<(), ListenerError> {
        let tls = Self::dial().await?;
        let framed = Framed::new(tls, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, mut stream) = framed.split();
        *self.write_half.lock().await = Some(sink);

        // Anonymous login: the literal password `oauth:` with no token.
        self.send_line("PASS oauth:".to_owned()).await;
        self.send_line(format!("NICK {}", self.username)).await;

        let pacer_stop = CancellationToken::new();
        let pacer_handle = tokio::spawn(self.run_join_pacer(pacer_stop.clone()));

        loop {
            let line = match stream.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    pacer_stop.cancel();
                    let _ = pacer_handle.await;
                    return Err(ListenerError::Tls(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e,
                    )));
                }
                None => {
                    pacer_stop.cancel();
                    let _ = pacer_handle.await;
                    return Ok(());
                }
            };

            match parser::command(&line) {
                "001" => self.on_001().await,
                "CAP" => debug!(listener = %self.username, %line, "capability negotiation"),
                "NOTICE" => self.on_notice(&line).await,
                "USERNOTICE" => self.on_usernotice(&line).await,
                "PRIVMSG" => self.on_privmsg(&line).await,
                "RECONNECT" => {
                    info!(listener = %self.username, "server requested RECONNECT");
                    pacer_stop.cancel();
                    let _ = pacer_handle.await;
                    return Ok(());
                }
                "PING" => self.send_line("PONG :tmi.twitch.tv".to_owned()).await,
                _ => trace!(listener = %self.username, %line, "unhandled line"),
            }
        }
    }

    async fn run_join_pacer(&'static self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(JOIN_PACE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    if let Some(identity) = self.channel_buffer.pop().await {
                        let login = identity.login.clone();
                        self.channels.lock().await.insert(login.clone(), identity);
                        self.send_line(format!("JOIN #{login}")).await;
                    }
                }
            }
        }
    }

    async fn on_001(&'static self) {
        info!(listener = %self.username, "connected (001)");
        self.send_line("CAP REQ :twitch.tv/commands twitch.tv/tags".to_owned())
            .await;

        if self.disconnected.swap(false, Ordering::AcqRel) {
            let mut channels = self.channels.lock().await;
            let replay: Vec<IdentitySlim> = channels.drain().map(|(_, v)| v).collect();
            drop(channels);
            for identity in replay {
                self.channel_buffer.push(identity).await;
            }
        }
    }

    async fn on_notice(&'static self, line: &str) {
        let guarded = std::panic::AssertUnwindSafe(self.on_notice_inner(line)).catch_unwind();
        if guarded.await.is_err() {
            tracing::error!(listener = %self.username, "panic in NOTICE callback; continuing");
        }
    }

    async fn on_notice_inner(&'static self, line: &str) {
        let tags = parser::parse(line);
        if tags.get("message").map(String::as_str) == Some("Error logging in") {
            self.retry_later.store(true, Ordering::Release);
            return;
        }

        let msg_id = tags.get("msg-id").map(String::as_str).unwrap_or("");
        if msg_id != "host_on" && msg_id != "host_off" {
            return;
        }

        let login = tags.get("channel").cloned().unwrap_or_default();
        let sender = self
            .channels
            .lock()
            .await
            .get(&login)
            .cloned()
            .unwrap_or_else(IdentitySlim::empty);

        let ev = event::build_host(&tags, msg_id == "host_on", sender);
        self.orchestrator.fire_event(ev).await;
    }

    async fn on_usernotice(&'static self, line: &str) {
        if self.orchestrator.is_primary() {
            self.orchestrator.forward_chat(line.to_owned()).await;
        }

        let tags = parser::parse(line);
        let msg_id = tags.get("msg-id").map(String::as_str).unwrap_or("");
        let ev = match msg_id {
            "sub" | "resub" | "subgift" => Some(event::build_sub(&tags, msg_id)),
            "raid" => Some(event::build_raid(&tags)),
            "ritual" => Some(event::build_ritual(&tags)),
            _ => None,
        };

        if let Some(ev) = ev {
            self.orchestrator.fire_event(ev).await;
        }
    }

    async fn on_privmsg(&'static self, line: &str) {
        let guarded = std::panic::AssertUnwindSafe(self.on_privmsg_inner(line)).catch_unwind();
        if guarded.await.is_err() {
            tracing::error!(listener = %self.username, "panic in PRIVMSG callback; continuing");
        }
    }

    async fn on_privmsg_inner(&'static self, line: &str) {
        if self.orchestrator.is_primary() {
            self.orchestrator.forward_chat(line.to_owned()).await;
        }

        let tags = parser::parse(line);
        let room_id = tags.get("room-id").cloned().unwrap_or_default();
        let room_login = tags.get("channel").cloned().unwrap_or_default();
        let user_id = tags.get("user-id").cloned().unwrap_or_default();
        let display_name = tags.get("display-name").cloned().unwrap_or_default();
        self.orchestrator
            .active_chatter(room_id, room_login, user_id, display_name)
            .await;

        if let Some(ev) = event::build_bits(&tags) {
            self.orchestrator.fire_event(ev).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_nick_is_in_justinfan_range() {
        for _ in 0..50 {
            let nick = random_nick();
            assert!(nick.starts_with("justinfan"));
            let suffix: u32 = nick["justinfan".len()..].parse().unwrap();
            assert!((1000..10000).contains(&suffix));
        }
    }
}
