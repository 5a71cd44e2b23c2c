//! Decodes a raw IRCv3 tagged line into a flat string-to-string map.
//!
//! Input shape: `@tag1=v1;tag2=v2 :nick!user@host CMD #channel :message-text`
//! (the trailing `:message-text` segment is optional). This is total on
//! non-empty input of the expected shape and never panics; a line missing
//! the expected delimiters simply yields fewer keys.

use std::collections::HashMap;

/// Parses a raw IRC line into its tags plus the derived `username`,
/// `channel` and (if present) `message` keys.
///
/// Splits once on `" :"` to separate the leading `tags :prefix CMD #channel`
/// segment from the trailing message segment, so a message body that itself
/// contains the literal substring `" :"` is preserved whole rather than
/// truncated at the first embedded occurrence.
pub fn parse(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    // Peel off the optional leading "@tag1=v1;tag2=v2 " segment first. What's
    // left always starts at the prefix's leading ':' (or, if there was no
    // prefix either, at the command verb), so the one remaining " :" in it
    // can only be the message separator.
    let (tag_segment, body) = match raw.strip_prefix('@') {
        Some(stripped) => match stripped.find(' ') {
            Some(sp) => (&stripped[..sp], &stripped[sp + 1..]),
            None => (stripped, ""),
        },
        None => ("", raw),
    };

    for pair in tag_segment.split(';') {
        let mut halves = pair.split('=');
        if let (Some(key), Some(value), None) = (halves.next(), halves.next(), halves.next()) {
            if !key.is_empty() {
                map.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    let mut body_parts = body.splitn(2, " :");
    let middle = body_parts.next().unwrap_or("");
    let message = body_parts.next();

    let middle_trimmed = middle.strip_prefix(':').unwrap_or(middle);
    if let Some((username, _)) = middle_trimmed.split_once('!') {
        map.insert("username".to_owned(), username.to_owned());
    }
    if let Some((_, channel)) = middle.split_once('#') {
        let channel = channel.split_whitespace().next().unwrap_or(channel);
        map.insert("channel".to_owned(), channel.to_owned());
    }

    if let Some(message) = message {
        map.insert("message".to_owned(), message.to_owned());
    }

    map
}

/// Extracts the command verb (`PRIVMSG`, `NOTICE`, `001`, `CAP`, ...) from a
/// raw line, skipping the optional tags and prefix segments. Used for
/// callback dispatch; the tag map returned by `parse` deliberately doesn't
/// carry this since it belongs to IRC framing, not message metadata.
pub fn command(raw: &str) -> &str {
    let mut s = raw;
    if let Some(stripped) = s.strip_prefix('@') {
        match stripped.find(' ') {
            Some(sp) => s = &stripped[sp + 1..],
            None => return "",
        }
    }
    if let Some(stripped) = s.strip_prefix(':') {
        match stripped.find(' ') {
            Some(sp) => s = &stripped[sp + 1..],
            None => return "",
        }
    }
    s.split_whitespace().next().unwrap_or("")
}
