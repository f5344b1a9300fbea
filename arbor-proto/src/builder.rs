//! Outgoing command-line builder.
//!
//! [`CmdBuilder`] accumulates a source, tags and parameters and
//! materializes the final `@tags :source CMD args… :trailing` line.
//! Tags may be added at any point before finalizing, including after
//! parameters; the tag block is serialized last so late additions
//! land in place.

use std::fmt::Display;

use crate::message::Message;

#[derive(Debug, Clone)]
pub struct CmdBuilder {
    msg: Message,
    trailing: bool,
}

impl CmdBuilder {
    /// Starts a line for `command` originating at `source` (a SID or
    /// UUID).
    pub fn new(source: impl Into<String>, command: &str) -> Self {
        let mut msg = Message::new(command, Vec::new());
        msg.source = Some(source.into());
        Self {
            msg,
            trailing: false,
        }
    }

    /// Appends one parameter.
    pub fn push(mut self, param: impl Into<String>) -> Self {
        self.msg.params.push(param.into());
        self
    }

    /// Appends a numeric parameter, typically a timestamp.
    pub fn push_int(self, param: impl Display) -> Self {
        self.push(param.to_string())
    }

    /// Appends the trailing parameter, always emitted in `:` form.
    /// Must be the last push.
    pub fn push_last(mut self, param: impl Into<String>) -> Self {
        self.trailing = true;
        self.push(param)
    }

    /// Adds or replaces a message tag.
    pub fn add_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.msg.tags.insert(key.into(), value.into());
        self
    }

    /// The finished line, without CR/LF.
    pub fn finalize(self) -> String {
        self.msg.serialize(self.trailing)
    }

    /// Access to the unserialized form.
    pub fn message(&self) -> &Message {
        &self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_source_command_params() {
        let line = CmdBuilder::new("001", "SQUIT")
            .push("002")
            .push_last("broken link")
            .finalize();
        assert_eq!(line, ":001 SQUIT 002 :broken link");
    }

    #[test]
    fn late_tags_land_in_the_tag_block() {
        let line = CmdBuilder::new("001AAAAAA", "AWAY")
            .push_last("brb")
            .add_tag("account", "alice")
            .finalize();
        assert_eq!(line, "@account=alice :001AAAAAA AWAY :brb");
    }

    #[test]
    fn push_int_formats_timestamps() {
        let line = CmdBuilder::new("001", "BURST").push_int(1700000000u64).finalize();
        assert_eq!(line, ":001 BURST 1700000000");
    }
}
