//! Domain types and classification for parsed IRC tag maps: the identity
//! type shared by channels and users, the outbound `Event` record, the
//! per-channel chatter roster batch, and one builder per Twitch `msg-id`/
//! PRIVMSG-bits case.
//!
//! Builders never fail. A malformed or missing tag degrades to an empty
//! string or a `-1` sentinel rather than raising; classification must never
//! interrupt the message pipeline (see the module-level error handling
//! notes in `orchestrator`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Known `EventType` tags, for callers that want to `match` on them without
/// committing the wire type to a closed enum (unexpected `msg-id` values
/// must still round-trip as a plain string, never an error).
pub const EVENT_TYPES: &[&str] = &[
    "sub", "resub", "subgift", "raid", "ritual", "host_on", "host_off", "bits",
];

/// A channel or user reference. Equality and hashing are defined over
/// `platform_id` alone, since a rename changes `login`/`display` but not
/// identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentitySlim {
    pub platform: String,
    pub platform_id: String,
    pub login: String,
    pub display: String,
}

impl IdentitySlim {
    pub fn twitch(platform_id: impl Into<String>, login: impl Into<String>, display: impl Into<String>) -> Self {
        IdentitySlim {
            platform: "twitch".to_owned(),
            platform_id: platform_id.into(),
            login: login.into(),
            display: display.into(),
        }
    }

    pub fn empty() -> Self {
        IdentitySlim {
            platform: "twitch".to_owned(),
            platform_id: String::new(),
            login: String::new(),
            display: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.platform_id.is_empty()
    }
}

impl PartialEq for IdentitySlim {
    fn eq(&self, other: &Self) -> bool {
        self.platform_id == other.platform_id
    }
}

impl Eq for IdentitySlim {}

impl std::hash::Hash for IdentitySlim {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.platform_id.hash(state);
    }
}

/// The universal outbound record forwarded to the event sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub platform: String,
    pub event_id: String,
    pub event_type: String,
    pub event_subtype: String,
    pub sender_id: String,
    pub sender_login: String,
    pub sender_display: String,
    pub target_id: String,
    pub target_login: String,
    pub target_display: String,
    pub channel_id: String,
    pub channel_login: String,
    pub channel_display: String,
    pub event_amount: i64,
    pub event_message: String,
    pub event_cmotes: Vec<String>,
}

impl Event {
    fn new(event_type: &str) -> Self {
        Event {
            time: Utc::now(),
            platform: "twitch".to_owned(),
            event_id: String::new(),
            event_type: event_type.to_owned(),
            event_subtype: String::new(),
            sender_id: String::new(),
            sender_login: String::new(),
            sender_display: String::new(),
            target_id: String::new(),
            target_login: String::new(),
            target_display: String::new(),
            channel_id: String::new(),
            channel_login: String::new(),
            channel_display: String::new(),
            event_amount: 0,
            event_message: String::new(),
            event_cmotes: Vec::new(),
        }
    }
}

/// The per-channel unique-chatter roster accumulated between flushes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChattersBatch {
    pub channel: IdentitySlim,
    chatters: Vec<IdentitySlim>,
}

impl ChattersBatch {
    pub fn new(channel: IdentitySlim) -> Self {
        ChattersBatch {
            channel,
            chatters: Vec::new(),
        }
    }

    pub fn chatters(&self) -> &[IdentitySlim] {
        &self.chatters
    }

    /// Inserts `chatter` unless a chatter with the same `platform_id` is
    /// already present. Returns `true` if it was newly inserted.
    pub fn insert(&mut self, chatter: IdentitySlim) -> bool {
        if self.chatters.iter().any(|c| c.platform_id == chatter.platform_id) {
            return false;
        }
        self.chatters.push(chatter);
        true
    }
}

/// Parses `s` as an `i64`, returning `default` on any failure (empty,
/// non-numeric, overflow).
pub fn parse_or(s: &str, default: i64) -> i64 {
    s.parse::<i64>().unwrap_or(default)
}

fn tag<'a>(tags: &'a HashMap<String, String>, key: &str) -> &'a str {
    tags.get(key).map(String::as_str).unwrap_or("")
}

/// Builds a `host_on`/`host_off` event from a NOTICE. `sender` is the
/// identity the listener already has on file for the hosting channel (empty
/// if unknown); nothing in the NOTICE payload itself identifies the sender
/// beyond the `channel` tag that `sender` was looked up by.
pub fn build_host(tags: &HashMap<String, String>, is_on: bool, sender: IdentitySlim) -> Event {
    let mut e = Event::new(if is_on { "host_on" } else { "host_off" });
    e.channel_id = sender.platform_id.clone();
    e.channel_login = sender.login.clone();
    e.channel_display = sender.display.clone();
    e.sender_id = sender.platform_id;
    e.sender_login = sender.login;
    e.sender_display = sender.display;
    e.event_amount = 0;

    if is_on {
        let message = tag(tags, "message");
        // Twitch's envelope is literally `"X is now hosting Y."`; trimming
        // the fixed 12-character lead-in and 13-character trailer leaves
        // just the target login/display text `Y`.
        let target = message
            .get(12..message.len().saturating_sub(13))
            .unwrap_or("")
            .to_owned();
        e.target_display = target.clone();
        e.target_login = target.to_lowercase();
    }

    e
}

/// Builds a `sub`/`resub`/`subgift` event from a USERNOTICE.
pub fn build_sub(tags: &HashMap<String, String>, msg_id: &str) -> Event {
    let mut e = Event::new(msg_id);
    e.event_id = tag(tags, "id").to_owned();
    e.channel_id = tag(tags, "room-id").to_owned();
    e.channel_login = tag(tags, "channel").to_owned();
    e.event_subtype = tag(tags, "msg-param-sub-plan").to_owned();
    e.event_message = tag(tags, "message").to_owned();

    let months = parse_or(tag(tags, "msg-param-months"), -1);
    e.event_amount = if months == 0 { 1 } else { months };

    let sender = IdentitySlim::twitch(
        tag(tags, "user-id"),
        tag(tags, "login"),
        tag(tags, "display-name"),
    );

    let recipient_id = tag(tags, "msg-param-recipient-id");
    if !recipient_id.is_empty() {
        e.sender_id = sender.platform_id;
        e.sender_login = sender.login;
        e.sender_display = sender.display;
        e.target_id = recipient_id.to_owned();
        e.target_login = tag(tags, "msg-param-recipient-user-name").to_owned();
        e.target_display = tag(tags, "msg-param-recipient-display-name").to_owned();
    } else {
        // Self-sub: the sender triple moves into target and sender is
        // cleared, per the classifier dispatch rule.
        e.target_id = sender.platform_id;
        e.target_login = sender.login;
        e.target_display = sender.display;
    }

    e
}

/// Builds a `raid` event from a USERNOTICE.
pub fn build_raid(tags: &HashMap<String, String>) -> Event {
    let mut e = Event::new("raid");
    e.event_id = tag(tags, "id").to_owned();
    e.channel_id = tag(tags, "room-id").to_owned();
    e.channel_login = tag(tags, "channel").to_owned();
    e.sender_id = tag(tags, "user-id").to_owned();
    e.sender_login = tag(tags, "login").to_owned();
    e.sender_display = tag(tags, "display-name").to_owned();
    e.target_id = e.channel_id.clone();
    e.target_login = tag(tags, "channel").to_owned();
    e.event_amount = parse_or(tag(tags, "msg-param-viewerCount"), -1);
    e
}

/// Builds a `ritual` event from a USERNOTICE. `EventAmount` is always `-1`;
/// rituals carry no numeric payload.
pub fn build_ritual(tags: &HashMap<String, String>) -> Event {
    let mut e = Event::new("ritual");
    e.event_id = tag(tags, "id").to_owned();
    e.channel_id = tag(tags, "room-id").to_owned();
    e.channel_login = tag(tags, "channel").to_owned();
    e.sender_id = tag(tags, "user-id").to_owned();
    e.sender_login = tag(tags, "login").to_owned();
    e.sender_display = tag(tags, "display-name").to_owned();
    e.event_subtype = tag(tags, "msg-param-ritual-name").to_owned();
    e.event_amount = -1;
    e
}

lazy_static::lazy_static! {
    static ref CHEERMOTE: Regex = Regex::new(r"^[A-Za-z]{3,15}\d+$").expect("static cheermote regex is valid");
}

/// Builds a `bits` event from a PRIVMSG whose `bits` tag parses as an
/// integer. Returns `None` when the tag is absent or unparseable — callers
/// must not emit an event in that case (spec: "no event is emitted for bits
/// if the tag is absent or unparseable").
pub fn build_bits(tags: &HashMap<String, String>) -> Option<Event> {
    let bits_raw = tags.get("bits")?;
    let amount: i64 = bits_raw.parse().ok()?;

    let mut e = Event::new("bits");
    e.event_id = tag(tags, "id").to_owned();
    e.channel_id = tag(tags, "room-id").to_owned();
    e.channel_login = tag(tags, "channel").to_owned();
    e.sender_id = tag(tags, "user-id").to_owned();
    e.sender_login = tag(tags, "username").to_owned();
    e.sender_display = tag(tags, "display-name").to_owned();
    e.event_amount = amount;
    e.event_message = tag(tags, "message").to_owned();
    e.event_cmotes = tag(tags, "message")
        .split_whitespace()
        .filter(|tok| CHEERMOTE.is_match(tok))
        .map(str::to_owned)
        .collect();
    Some(e)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn bits_privmsg_builds_event_with_cmotes() {
        let t = tags(&[
            ("badge-info", ""),
            ("bits", "100"),
            ("display-name", "User"),
            ("username", "user"),
            ("id", "abc"),
            ("room-id", "12"),
            ("channel", "somechannel"),
            ("user-id", "34"),
            ("message", "Cheer100 hello"),
        ]);
        let e = build_bits(&t).expect("bits tag parses");
        assert_eq!(e.event_type, "bits");
        assert_eq!(e.event_id, "abc");
        assert_eq!(e.event_amount, 100);
        assert_eq!(e.event_cmotes, vec!["Cheer100".to_owned()]);
        assert_eq!(e.sender_id, "34");
        assert_eq!(e.sender_login, "user");
        assert_eq!(e.channel_id, "12");
        assert_eq!(e.channel_login, "somechannel");
    }

    #[test]
    fn bits_sender_login_comes_from_username_tag_not_lowercased_display() {
        let t = tags(&[
            ("bits", "1"),
            ("display-name", "ÜserName"),
            ("username", "username_login"),
        ]);
        let e = build_bits(&t).expect("bits tag parses");
        assert_eq!(e.sender_login, "username_login");
        assert_eq!(e.sender_display, "ÜserName");
    }

    #[test]
    fn subgift_with_recipient() {
        let t = tags(&[
            ("id", "evt-1"),
            ("msg-id", "subgift"),
            ("msg-param-sub-plan", "1000"),
            ("msg-param-recipient-id", "77"),
            ("msg-param-recipient-user-name", "bob"),
            ("msg-param-recipient-display-name", "Bob"),
            ("user-id", "5"),
            ("login", "alice"),
            ("display-name", "Alice"),
            ("room-id", "12"),
            ("channel", "somechannel"),
        ]);
        let e = build_sub(&t, "subgift");
        assert_eq!(e.event_type, "subgift");
        assert_eq!(e.event_id, "evt-1");
        assert_eq!(e.event_subtype, "1000");
        assert_eq!(e.channel_id, "12");
        assert_eq!(e.channel_login, "somechannel");
        assert_eq!(e.sender_id, "5");
        assert_eq!(e.sender_login, "alice");
        assert_eq!(e.sender_display, "Alice");
        assert_eq!(e.target_id, "77");
        assert_eq!(e.target_login, "bob");
        assert_eq!(e.target_display, "Bob");
        // months tag absent -> parse_or(-1)
        assert_eq!(e.event_amount, -1);
    }

    #[test]
    fn self_sub_no_recipient() {
        let t = tags(&[
            ("msg-id", "sub"),
            ("user-id", "5"),
            ("login", "alice"),
            ("display-name", "Alice"),
            ("msg-param-months", "0"),
            ("channel", "somechannel"),
        ]);
        let e = build_sub(&t, "sub");
        assert_eq!(e.channel_login, "somechannel");
        assert!(e.sender_id.is_empty());
        assert!(e.sender_login.is_empty());
        assert!(e.sender_display.is_empty());
        assert_eq!(e.target_id, "5");
        assert_eq!(e.target_login, "alice");
        assert_eq!(e.target_display, "Alice");
        // months=0 bumped to 1
        assert_eq!(e.event_amount, 1);
    }

    #[test]
    fn host_on_trims_hosting_envelope() {
        let t = tags(&[("message", "X is now hosting Y.")]);
        let e = build_host(&t, true, IdentitySlim::twitch("99", "x", "X"));
        assert_eq!(e.target_display, "Y");
        assert_eq!(e.target_login, "y");
        assert_eq!(e.channel_login, "x");
    }

    #[test]
    fn host_off_has_no_target() {
        let t = tags(&[]);
        let e = build_host(&t, false, IdentitySlim::twitch("99", "x", "X"));
        assert_eq!(e.event_type, "host_off");
        assert!(e.target_login.is_empty());
    }

    #[test]
    fn raid_parses_viewer_count() {
        let t = tags(&[
            ("id", "evt-2"),
            ("room-id", "12"),
            ("channel", "somechannel"),
            ("user-id", "5"),
            ("login", "alice"),
            ("display-name", "Alice"),
            ("msg-param-viewerCount", "250"),
        ]);
        let e = build_raid(&t);
        assert_eq!(e.event_id, "evt-2");
        assert_eq!(e.event_amount, 250);
        assert_eq!(e.channel_id, "12");
        assert_eq!(e.channel_login, "somechannel");
        assert_eq!(e.target_id, "12");
        assert_eq!(e.target_login, "somechannel");
    }

    #[test]
    fn raid_viewer_count_unparseable_is_negative_one() {
        let t = tags(&[("msg-param-viewerCount", "not-a-number")]);
        let e = build_raid(&t);
        assert_eq!(e.event_amount, -1);
    }

    #[test]
    fn ritual_amount_is_always_negative_one() {
        let t = tags(&[
            ("msg-param-ritual-name", "new_chatter"),
            ("channel", "somechannel"),
        ]);
        let e = build_ritual(&t);
        assert_eq!(e.event_amount, -1);
        assert_eq!(e.event_subtype, "new_chatter");
        assert_eq!(e.channel_login, "somechannel");
    }

    #[test]
    fn bits_tag_absent_yields_no_event() {
        let t = tags(&[("message", "no bits here")]);
        assert!(build_bits(&t).is_none());
    }

    #[test]
    fn bits_tag_non_numeric_yields_no_event() {
        let t = tags(&[("bits", "lots")]);
        assert!(build_bits(&t).is_none());
    }

    #[test]
    fn chatters_batch_dedups_by_platform_id() {
        let mut batch = ChattersBatch::new(IdentitySlim::twitch("12", "chan", "Chan"));
        assert!(batch.insert(IdentitySlim::twitch("34", "user", "User")));
        assert!(!batch.insert(IdentitySlim::twitch("34", "user", "User")));
        assert_eq!(batch.chatters().len(), 1);
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or("42", -1), 42);
        assert_eq!(parse_or("not a number", -1), -1);
        assert_eq!(parse_or("", -1), -1);
    }
}
