//! The connection/channel orchestrator: owns the listener pool, shards
//! channels across it, paces first connects, drives the outbound sink
//! drain, aggregates chatters, and gates everything on primary/standby
//! status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::ChattersSink;
use crate::event::{ChattersBatch, Event, IdentitySlim};
use crate::listener::{self, Listener};
use crate::queue::BoundedQueue;
use crate::sinks::{ChatSink, EventSink};

const CONNECT_QUEUE_CAPACITY: usize = 20;
const BUFFER_EVENTS_CAPACITY: usize = 250;
const BUFFER_CHAT_CAPACITY: usize = 2500;
const LISTENER_CHANNEL_BUFFER_CAPACITY: usize = 10_000;
const ACTIVE_CHATTERS_INITIAL_CAPACITY: usize = 25_000;

const CONNECT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);
const CHATTER_FLUSH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SINK_DRAIN_INTERVAL: Duration = Duration::from_micros(500);
const HEALTH_PING_INTERVAL: Duration = Duration::from_millis(250);

/// The admission signal for the connect scheduler: fewer than this many
/// listeners mid-JOIN-drain means it's safe to wake another one up.
///
/// This has no backoff — if three listeners never finish draining their
/// buffer, the connect queue stalls forever. Known limitation, left as-is
/// rather than silently redesigned.
const BUSY_THRESHOLD: usize = 3;

pub struct Orchestrator {
    pool: RwLock<Vec<&'static Listener>>,
    channels: RwLock<HashMap<String, IdentitySlim>>,
    connect_queue: BoundedQueue<String>,
    buffer_events: BoundedQueue<Event>,
    buffer_chat: BoundedQueue<String>,
    active_chatters: Mutex<Vec<ChattersBatch>>,
    is_primary: AtomicBool,
    channels_per_listener: usize,
    event_sink: Box<dyn EventSink>,
    chat_sink: Box<dyn ChatSink>,
    db: Box<dyn ChattersSink>,
    closer: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        channels_per_listener: usize,
        event_sink: Box<dyn EventSink>,
        chat_sink: Box<dyn ChatSink>,
        db: Box<dyn ChattersSink>,
        closer: CancellationToken,
    ) -> Self {
        Orchestrator {
            pool: RwLock::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
            connect_queue: BoundedQueue::new(CONNECT_QUEUE_CAPACITY),
            buffer_events: BoundedQueue::new(BUFFER_EVENTS_CAPACITY),
            buffer_chat: BoundedQueue::new(BUFFER_CHAT_CAPACITY),
            active_chatters: Mutex::new(Vec::with_capacity(ACTIVE_CHATTERS_INITIAL_CAPACITY)),
            is_primary: AtomicBool::new(false),
            channels_per_listener,
            event_sink,
            chat_sink,
            db,
            closer,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Cancels the shared process closer, as the `force-restart` control
    /// method and an unrecoverable IRC login failure both do.
    pub fn request_shutdown(&self) {
        self.closer.cancel();
    }

    pub fn set_primary(&self, value: bool) {
        self.is_primary.store(value, Ordering::SeqCst);
    }

    pub async fn pool_size(&self) -> usize {
        self.pool.read().await.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// `true` iff no listener in the pool currently has channels waiting to
    /// be JOINed.
    pub async fn are_you_ready(&self) -> bool {
        let pool = self.pool.read().await;
        pool.iter().all(|l| l.buffer_len() == 0)
    }

    /// Registers (or renames) a channel and assigns it to a listener.
    /// Calling this twice with an identical `(platform_id, login)` is a
    /// no-op after the first call.
    pub async fn listen_to_channel(&'static self, identity: IdentitySlim) {
        let existing = self.channels.read().await.get(&identity.platform_id).cloned();

        match existing {
            Some(current) if current.login == identity.login => {
                // Already registered under this exact login; nothing to do.
            }
            Some(current) => {
                // Rename: swap the authoritative entry, PART the old login
                // everywhere, then after a delay re-join under the new one.
                self.channels
                    .write()
                    .await
                    .insert(identity.platform_id.clone(), identity.clone());
                self.part_channel(&current.login).await;

                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    self.assign_to_listener_for_rename(identity).await;
                });
            }
            None => {
                self.channels
                    .write()
                    .await
                    .insert(identity.platform_id.clone(), identity.clone());
                self.assign_to_listener(identity).await;
            }
        }
    }

    /// Picks the last listener in the pool if it has room, otherwise opens
    /// a fresh one. The pool's *identity* (which listener is "last") may
    /// have changed since the caller decided to call this — e.g. the
    /// 1-second rename delay above racing a concurrent new-channel
    /// assignment — and that race is intentionally left in place (see
    /// DESIGN.md); only the old bug of addressing into a moved-from slice
    /// is fixed, by storing listener handles instead of values.
    async fn assign_to_listener(&'static self, identity: IdentitySlim) {
        if self.pool.read().await.is_empty() {
            self.create_listener().await;
        }

        let last = {
            let pool = self.pool.read().await;
            *pool.last().expect("pool is non-empty after create_listener")
        };

        let has_room = last.channel_count().await + last.buffer_len() < self.channels_per_listener;
        if has_room {
            last.enqueue_channel(identity).await;
        } else {
            let fresh = self.create_listener().await;
            fresh.enqueue_channel(identity).await;
        }
    }

    /// Re-assigns a renamed channel after the 1-second PART delay: first
    /// listener in pool order whose joined-channel count alone has room.
    /// Unlike `assign_to_listener`, a miss is simply dropped — a rename
    /// never creates a new listener.
    async fn assign_to_listener_for_rename(&'static self, identity: IdentitySlim) {
        let pool = self.pool.read().await;
        for listener in pool.iter() {
            if listener.channel_count().await < self.channels_per_listener {
                listener.enqueue_channel(identity).await;
                return;
            }
        }
    }

    async fn create_listener(&'static self) -> &'static Listener {
        let username = self.unique_nick().await;
        let new_listener: &'static Listener = Box::leak(Box::new(Listener::new(
            username.clone(),
            self,
            self.closer.clone(),
            LISTENER_CHANNEL_BUFFER_CAPACITY,
        )));

        self.pool.write().await.push(new_listener);
        self.connect_queue.push(username).await;
        new_listener
    }

    async fn unique_nick(&self) -> String {
        loop {
            let candidate = listener::random_nick();
            let pool = self.pool.read().await;
            if !pool.iter().any(|l| l.username == candidate) {
                return candidate;
            }
        }
    }

    /// Sends `PART` on every listener and removes the login from each
    /// listener's channel map. The orchestrator's own `channels` map is
    /// updated separately by the rename path.
    pub async fn part_channel(&self, login: &str) {
        let pool = self.pool.read().await;
        for listener in pool.iter() {
            listener.part(login).await;
        }
    }

    /// Pushes `event` onto the outbound event buffer, discarding it
    /// entirely in standby mode.
    pub async fn fire_event(&self, event: Event) {
        if self.is_primary() {
            self.buffer_events.push(event).await;
        }
    }

    /// Pushes a raw chat line onto the outbound chat buffer, discarding it
    /// in standby mode. Callers typically check `is_primary()` themselves
    /// first so they can skip the allocation; the gate here stays in place
    /// regardless, so the invariant holds no matter what the caller does.
    pub async fn forward_chat(&self, raw: String) {
        if self.is_primary() {
            self.buffer_chat.push(raw).await;
        }
    }

    /// Idempotent insert of a chatter into the roster batch for their
    /// channel. Called unconditionally for every PRIVMSG, per spec; a
    /// PRIVMSG missing `room-id`/`user-id` still records a chatter under an
    /// empty identity rather than being dropped. Guarded against panics: a
    /// failure here must never take down the listener's receive loop.
    pub async fn active_chatter(&self, room_id: String, room_login: String, user_id: String, display_name: String) {
        let guarded =
            std::panic::AssertUnwindSafe(self.active_chatter_inner(room_id, room_login, user_id, display_name))
                .catch_unwind();
        if guarded.await.is_err() {
            tracing::error!("panic in active_chatter; continuing");
        }
    }

    async fn active_chatter_inner(&self, room_id: String, room_login: String, user_id: String, display_name: String) {
        let login = display_name.to_lowercase();
        let chatter = IdentitySlim::twitch(user_id, login, display_name);

        let mut batches = self.active_chatters.lock().await;
        match batches.iter_mut().find(|b| b.channel.platform_id == room_id) {
            Some(batch) => {
                batch.insert(chatter);
            }
            None => {
                let mut batch = ChattersBatch::new(IdentitySlim::twitch(room_id, room_login, String::new()));
                batch.insert(chatter);
                batches.push(batch);
            }
        }
    }

    /// `QUIT`s every listener and closes both sink clients. Background
    /// tickers stop via the shared closer.
    pub async fn close_listeners(&self) {
        let pool = self.pool.read().await;
        for listener in pool.iter() {
            listener.quit().await;
        }
        drop(pool);

        self.event_sink.close().await;
        self.chat_sink.close().await;
    }

    pub fn spawn_background_tasks(&'static self) {
        tokio::spawn(self.run_connect_scheduler());
        tokio::spawn(self.run_chatter_flush());
        tokio::spawn(self.run_sink_drain());
        tokio::spawn(self.run_health_ping());
    }

    /// Listeners currently mid-JOIN-drain: connected *and* still holding
    /// buffered channels. A listener can have a non-empty buffer the moment
    /// a channel is assigned to it, well before its turn in `connect_queue`
    /// comes up — counting those as busy would make the scheduler stall
    /// forever on pool sizes under `BUSY_THRESHOLD`, since a not-yet-dialed
    /// listener's buffer never drains on its own.
    async fn busy_listener_count(&self) -> usize {
        let pool = self.pool.read().await;
        pool.iter().filter(|l| l.is_listening() && l.buffer_len() > 0).count()
    }

    async fn find_listener(&self, username: &str) -> Option<&'static Listener> {
        self.pool.read().await.iter().find(|l| l.username == username).copied()
    }

    /// Every second, if fewer than `BUSY_THRESHOLD` listeners are currently
    /// mid-JOIN-drain, wakes up the next queued listener's connection.
    /// Paces first connects so Twitch's global rate limit isn't tripped.
    async fn run_connect_scheduler(&'static self) {
        let mut ticker = tokio::time::interval(CONNECT_SCHEDULER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    if self.busy_listener_count().await >= BUSY_THRESHOLD {
                        continue;
                    }
                    if let Some(username) = self.connect_queue.pop().await {
                        if let Some(listener) = self.find_listener(&username).await {
                            tokio::spawn(listener.listen());
                        }
                    }
                }
            }
        }
    }

    /// Every 15 minutes, if primary, submits the whole chatter roster to
    /// the database and atomically swaps in a fresh empty one.
    async fn run_chatter_flush(&'static self) {
        let mut ticker = tokio::time::interval(CHATTER_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.is_primary() {
                        continue;
                    }
                    let batch = {
                        let mut chatters = self.active_chatters.lock().await;
                        std::mem::replace(&mut *chatters, Vec::with_capacity(ACTIVE_CHATTERS_INITIAL_CAPACITY))
                    };
                    if batch.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.db.flush_chatters(&batch).await {
                        warn!(error = %e, "chatter flush failed");
                    }
                }
            }
        }
    }

    /// Every 500µs, drains at most one event and one chat line to their
    /// respective sinks, provided the sink is connected.
    async fn run_sink_drain(&'static self) {
        let mut ticker = tokio::time::interval(SINK_DRAIN_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    if self.event_sink.is_connected() {
                        if let Some(event) = self.buffer_events.pop().await {
                            self.event_sink.process_event(event).await;
                        }
                    }
                    if self.chat_sink.is_connected() {
                        if let Some(raw) = self.buffer_chat.pop().await {
                            self.chat_sink.twitch_chatter(raw).await;
                        }
                    }
                }
            }
        }
    }

    /// Every 250ms, if primary and the chat sink is connected, sends a
    /// fire-and-forget health ping.
    async fn run_health_ping(&'static self) {
        let mut ticker = tokio::time::interval(HEALTH_PING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    if self.chat_sink.is_connected() && self.is_primary() {
                        self.chat_sink.im_here(true).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NullEventSink;
    #[async_trait]
    impl EventSink for NullEventSink {
        async fn process_event(&self, _event: Event) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    struct NullChatSink;
    #[async_trait]
    impl ChatSink for NullChatSink {
        async fn twitch_chatter(&self, _raw: String) {}
        async fn im_here(&self, _alive: bool) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    struct NullChattersSink(StdMutex<Vec<Vec<ChattersBatch>>>);
    #[async_trait]
    impl ChattersSink for NullChattersSink {
        async fn flush_chatters(&self, batches: &[ChattersBatch]) -> Result<(), crate::db::StorageError> {
            self.0.lock().unwrap().push(batches.to_vec());
            Ok(())
        }
    }

    fn leak_orchestrator(channels_per_listener: usize) -> &'static Orchestrator {
        Box::leak(Box::new(Orchestrator::new(
            channels_per_listener,
            Box::new(NullEventSink),
            Box::new(NullChatSink),
            Box::new(NullChattersSink(StdMutex::new(Vec::new()))),
            CancellationToken::new(),
        )))
    }

    fn identity(id: &str, login: &str) -> IdentitySlim {
        IdentitySlim::twitch(id, login, login)
    }

    #[tokio::test]
    async fn sharding_invariant_across_listen_to_channel_calls() {
        let orch = leak_orchestrator(2);
        for i in 0..5 {
            orch.listen_to_channel(identity(&i.to_string(), &format!("chan{i}"))).await;
        }

        assert_eq!(orch.channel_count().await, 5);
        assert_eq!(orch.pool_size().await, 3);

        let pool = orch.pool.read().await;
        let mut sizes = Vec::new();
        for l in pool.iter() {
            sizes.push(l.channel_count().await + l.buffer_len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        for size in sizes {
            assert!(size <= 2);
        }
    }

    #[tokio::test]
    async fn rename_idempotence_same_identity_twice_is_noop() {
        let orch = leak_orchestrator(1000);
        let u = identity("42", "old");
        orch.listen_to_channel(u.clone()).await;
        orch.listen_to_channel(u).await;
        assert_eq!(orch.channel_count().await, 1);
        assert_eq!(orch.pool_size().await, 1);
    }

    #[tokio::test]
    async fn rename_reassignment_uses_first_fit_and_never_creates_a_listener() {
        let orch = leak_orchestrator(1);
        orch.listen_to_channel(identity("1", "chanA")).await;
        orch.listen_to_channel(identity("2", "chanB")).await;
        assert_eq!(orch.pool_size().await, 2);

        {
            let pool = orch.pool.read().await;
            assert_eq!(pool[0].buffer_len(), 1);
            assert_eq!(pool[1].buffer_len(), 1);
        }

        // Neither listener's channel_count() has room freed up (neither has
        // ever actually joined anything), so the old last-listener-with-room
        // algorithm would spin up a third listener here. First-fit on
        // channel_count() alone must not.
        orch.assign_to_listener_for_rename(identity("1", "chanA-renamed")).await;

        assert_eq!(orch.pool_size().await, 2, "rename must never create a new listener");
        let pool = orch.pool.read().await;
        assert_eq!(
            pool[0].buffer_len(),
            2,
            "first-fit picks the first listener with room, not the last"
        );
        assert_eq!(pool[1].buffer_len(), 1);
    }

    #[tokio::test]
    async fn busy_listener_count_excludes_not_yet_connected_listeners() {
        let orch = leak_orchestrator(1000);
        // Assigning a channel fills a fresh listener's buffer immediately,
        // well before its turn in the connect queue ever calls Listen() on
        // it. Counting it as busy here would stall the connect scheduler
        // forever on a small pool.
        orch.listen_to_channel(identity("1", "chanA")).await;
        assert_eq!(orch.busy_listener_count().await, 0);
    }

    #[tokio::test]
    async fn chatter_dedup_by_platform_id() {
        let orch = leak_orchestrator(1000);
        for _ in 0..5 {
            orch.active_chatter(
                "12".to_owned(),
                "chan".to_owned(),
                "34".to_owned(),
                "User".to_owned(),
            )
            .await;
        }
        let batches = orch.active_chatters.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].chatters().len(), 1);
    }

    #[tokio::test]
    async fn active_chatter_records_unconditionally_even_with_empty_ids() {
        let orch = leak_orchestrator(1000);
        orch.active_chatter(String::new(), String::new(), String::new(), String::new())
            .await;
        let batches = orch.active_chatters.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].channel.platform_id, "");
        assert_eq!(batches[0].chatters().len(), 1);
    }

    #[tokio::test]
    async fn primary_gating_drops_events_and_chat_when_standby() {
        let orch = leak_orchestrator(1000);
        assert!(!orch.is_primary());

        orch.fire_event(crate::event::build_ritual(&Default::default())).await;
        orch.forward_chat("raw line".to_owned()).await;

        assert_eq!(orch.buffer_events.len(), 0);
        assert_eq!(orch.buffer_chat.len(), 0);

        orch.set_primary(true);
        orch.fire_event(crate::event::build_ritual(&Default::default())).await;
        orch.forward_chat("raw line".to_owned()).await;
        assert_eq!(orch.buffer_events.len(), 1);
        assert_eq!(orch.buffer_chat.len(), 1);
    }
}
