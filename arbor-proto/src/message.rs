//! Line codec: one LF-terminated byte line in, one [`Message`] out.
//!
//! A line parses as an optional `@` tag block, an optional `:` source
//! prefix, a command verb, zero or more middle parameters and an
//! optional `:` trailing parameter which may contain spaces. Tag
//! values use the IRCv3 escaping rules and are decoded on ingest and
//! re-encoded on emit.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Why a line failed to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The line contained an embedded NUL byte. Fatal to the link.
    #[error("line contains an embedded NUL byte")]
    NulByte,
    /// Nothing but whitespace (callers usually skip these instead).
    #[error("empty line")]
    Empty,
    /// A tag block or source prefix with no command after it.
    #[error("line has no command verb")]
    MissingCommand,
    /// The non-tag portion exceeded the 512-byte line budget.
    #[error("line exceeds {0} bytes")]
    TooLong(usize),
}

/// A decoded IRC line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Decoded message tags, sorted by key for deterministic emit.
    pub tags: BTreeMap<String, String>,
    /// The `:source` prefix without the colon, if present.
    pub source: Option<String>,
    /// Command verb, uppercased.
    pub command: String,
    /// Middle parameters followed by the trailing parameter, decoded.
    pub params: Vec<String>,
}

impl Message {
    /// Builds a message with no tags or source.
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            tags: BTreeMap::new(),
            source: None,
            command: command.to_ascii_uppercase(),
            params,
        }
    }

    /// Parses one line. The caller strips the LF; a trailing CR is
    /// stripped here. Empty lines yield [`MessageError::Empty`] so
    /// read loops can skip them without special-casing beforehand.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        if line.bytes().any(|b| b == 0) {
            return Err(MessageError::NulByte);
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(MessageError::Empty);
        }

        let mut tags = BTreeMap::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (block, remainder) = split_word(after);
            for item in block.split(';').filter(|t| !t.is_empty()) {
                match item.split_once('=') {
                    Some((k, v)) => tags.insert(k.to_string(), unescape_tag_value(v)),
                    None => tags.insert(item.to_string(), String::new()),
                };
            }
            rest = remainder;
        }

        if rest.len() > super::MAX_LINE_LENGTH {
            return Err(MessageError::TooLong(super::MAX_LINE_LENGTH));
        }

        let mut source = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (prefix, remainder) = split_word(after);
            if prefix.is_empty() || remainder.is_empty() {
                return Err(MessageError::MissingCommand);
            }
            source = Some(prefix.to_string());
            rest = remainder;
        }

        let (verb, mut rest) = split_word(rest);
        if verb.is_empty() {
            return Err(MessageError::MissingCommand);
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            let (word, remainder) = split_word(rest);
            params.push(word.to_string());
            rest = remainder;
        }

        Ok(Self {
            tags,
            source,
            command: verb.to_ascii_uppercase(),
            params,
        })
    }
}

impl Message {
    /// Serializes to wire form. With `force_trailing` the last
    /// parameter always takes the `:` form, the convention for
    /// descriptions and reasons; otherwise the colon appears only
    /// when the parameter requires it.
    pub fn serialize(&self, force_trailing: bool) -> String {
        let mut out = String::new();
        if !self.tags.is_empty() {
            out.push('@');
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push_str(key);
                if !value.is_empty() {
                    out.push('=');
                    out.push_str(&escape_tag_value(value));
                }
            }
            out.push(' ');
        }
        if let Some(ref source) = self.source {
            out.push(':');
            out.push_str(source);
            out.push(' ');
        }
        out.push_str(&self.command);
        if let Some((last, middles)) = self.params.split_last() {
            for param in middles {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if force_trailing || last.is_empty() || last.starts_with(':') || last.contains(' ') {
                out.push(':');
            }
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize(false))
    }
}

/// Splits off the first space-delimited word, eating the separator run.
fn split_word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(idx) => (&s[..idx], s[idx..].trim_start_matches(' ')),
        None => (s, ""),
    }
}

/// Decodes the IRCv3 tag value escapes.
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            // A lone or unknown escape drops the backslash.
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Encodes the IRCv3 tag value escapes.
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_command() {
        let msg = Message::parse("PING 001").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["001"]);
        assert!(msg.source.is_none());
        assert!(msg.tags.is_empty());
    }

    #[test]
    fn parses_source_and_trailing() {
        let msg = Message::parse(":001 SQUIT 002 :broken link").unwrap();
        assert_eq!(msg.source.as_deref(), Some("001"));
        assert_eq!(msg.command, "SQUIT");
        assert_eq!(msg.params, vec!["002", "broken link"]);
    }

    #[test]
    fn parses_tags_with_escapes() {
        let msg = Message::parse("@time=2024;msg=a\\sb\\:c :001AAAAAA AWAY :gone").unwrap();
        assert_eq!(msg.tags.get("time").map(String::as_str), Some("2024"));
        assert_eq!(msg.tags.get("msg").map(String::as_str), Some("a b;c"));
        assert_eq!(msg.params, vec!["gone"]);
    }

    #[test]
    fn strips_carriage_return_and_uppercases() {
        let msg = Message::parse(":002 ping 002\r").unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn rejects_nul_bytes() {
        assert_eq!(Message::parse("PING\0 x"), Err(MessageError::NulByte));
    }

    #[test]
    fn empty_line_is_distinguishable() {
        assert_eq!(Message::parse("   "), Err(MessageError::Empty));
    }

    #[test]
    fn rejects_prefix_without_command() {
        assert_eq!(Message::parse(":001"), Err(MessageError::MissingCommand));
        assert_eq!(Message::parse(":001 "), Err(MessageError::MissingCommand));
    }

    #[test]
    fn round_trips_argument_vector() {
        let cases = [
            ":001 SERVER inner.example.net 002 :Inner server",
            ":001AAAAAB FJOIN #chan 12345 +nt :o,001AAAAAB v,001AAAAAC",
            "@s=x\\sy :001 METADATA * key :some value here",
            ":001 ENDBURST",
            ":001 PRIVMSG #c ::leading colon",
        ];
        for case in cases {
            let first = Message::parse(case).unwrap();
            let emitted = first.to_string();
            let second = Message::parse(&emitted).unwrap();
            assert_eq!(first, second, "case: {case}");
        }
    }

    #[test]
    fn empty_trailing_survives_round_trip() {
        let msg = Message::new("AWAY", vec![String::new()]);
        let reparsed = Message::parse(&msg.to_string()).unwrap();
        assert_eq!(reparsed.params, vec![String::new()]);
    }

    #[test]
    fn rejects_oversized_line() {
        let line = format!("PRIVMSG #c :{}", "x".repeat(600));
        assert!(matches!(Message::parse(&line), Err(MessageError::TooLong(_))));
    }

    #[test]
    fn tag_block_not_counted_against_line_budget() {
        let line = format!("@huge={} PING 001", "y".repeat(480));
        assert!(Message::parse(&line).is_ok());
    }
}
