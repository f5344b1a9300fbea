//! The channel table: channels, memberships, modes, topics and list
//! modes, with the timestamp-based merge rules applied on FJOIN.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use arbor_proto::Uid;

/// Status prefix ranks, highest wins.
pub const VOICE_VALUE: u32 = 10000;
pub const HALFOP_VALUE: u32 = 20000;
pub const OP_VALUE: u32 = 30000;

/// Rank of a status mode letter, 0 for unknown.
pub fn prefix_rank(letter: char) -> u32 {
    match letter {
        'v' => VOICE_VALUE,
        'h' => HALFOP_VALUE,
        'o' => OP_VALUE,
        _ => 0,
    }
}

/// Maximum mode changes per emitted FMODE line.
pub const MAX_MODES: usize = 20;

/// Simple channel mode letters this core understands. Everything else
/// belongs to mode modules outside the S2S layer.
const SIMPLE_MODES: &str = "imnpst";

/// List mode letters, stored as mask lists.
const LIST_MODES: &str = "be";

#[derive(Debug, Clone, Default)]
pub struct Membership {
    /// Status mode letters ('o', 'h', 'v'), highest rank first.
    pub prefixes: String,
    /// Per-membership metadata slots.
    pub metadata: HashMap<String, String>,
}

impl Membership {
    pub fn with_prefixes(prefixes: &str) -> Self {
        let mut m = Self::default();
        for c in prefixes.chars() {
            m.add_prefix(c);
        }
        m
    }

    pub fn add_prefix(&mut self, letter: char) {
        if prefix_rank(letter) == 0 || self.prefixes.contains(letter) {
            return;
        }
        self.prefixes.push(letter);
        let mut chars: Vec<char> = self.prefixes.chars().collect();
        chars.sort_by_key(|c| std::cmp::Reverse(prefix_rank(*c)));
        self.prefixes = chars.into_iter().collect();
    }

    pub fn remove_prefix(&mut self, letter: char) {
        self.prefixes.retain(|c| c != letter);
    }

    /// Rank of the highest status this member holds.
    pub fn rank(&self) -> u32 {
        self.prefixes.chars().map(prefix_rank).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListModeEntry {
    pub mask: String,
    pub setter: String,
    pub set_ts: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp. Lower wins every merge.
    pub ts: u64,
    /// Simple mode letters currently set.
    pub simple_modes: BTreeSet<char>,
    pub key: Option<String>,
    pub limit: Option<u32>,
    pub topic: Option<Topic>,
    /// When a topic was last set; zero means never, and an empty
    /// topic with a nonzero set time still bursts so it can override
    /// an older non-empty one.
    pub topic_set: u64,
    pub members: HashMap<Uid, Membership>,
    pub list_modes: BTreeMap<char, Vec<ListModeEntry>>,
    pub metadata: HashMap<String, String>,
}

impl Channel {
    pub fn new(name: &str, ts: u64) -> Self {
        Self {
            name: name.to_string(),
            ts,
            ..Default::default()
        }
    }

    pub fn join(&mut self, uid: Uid, prefixes: &str) {
        let memb = self
            .members
            .entry(uid)
            .or_insert_with(Membership::default);
        for c in prefixes.chars() {
            memb.add_prefix(c);
        }
    }

    pub fn part(&mut self, uid: &Uid) -> bool {
        self.members.remove(uid).is_some()
    }

    pub fn is_list_mode(letter: char) -> bool {
        LIST_MODES.contains(letter)
    }

    pub fn is_simple_mode(letter: char) -> bool {
        SIMPLE_MODES.contains(letter)
    }

    /// Adds a list-mode entry unless the mask is already present.
    pub fn add_list_entry(&mut self, letter: char, entry: ListModeEntry) {
        let list = self.list_modes.entry(letter).or_default();
        if !list.iter().any(|e| e.mask.eq_ignore_ascii_case(&entry.mask)) {
            list.push(entry);
        }
    }

    /// Strips every mode, prefix and list entry, pushing the removals
    /// onto `stack` so the change can be announced as one FMODE.
    /// Used when the local side loses a TS merge.
    pub fn strip_all_modes(&mut self, stack: &mut ModeStack) {
        for letter in std::mem::take(&mut self.simple_modes) {
            stack.push(false, letter, None);
        }
        if let Some(key) = self.key.take() {
            stack.push(false, 'k', Some(key));
        }
        if self.limit.take().is_some() {
            stack.push(false, 'l', None);
        }
        for (letter, entries) in std::mem::take(&mut self.list_modes) {
            for entry in entries {
                stack.push(false, letter, Some(entry.mask));
            }
        }
        for (uid, memb) in self.members.iter_mut() {
            for letter in std::mem::take(&mut memb.prefixes).chars() {
                stack.push(false, letter, Some(uid.to_string()));
            }
        }
    }

    /// Applies one mode change. Status changes name members by UUID.
    /// Unknown letters are ignored; the mode modules that own them are
    /// not part of this core.
    pub fn apply_mode(&mut self, adding: bool, letter: char, param: Option<&str>, setter_ts: u64) {
        match letter {
            'k' => {
                if adding {
                    if let Some(k) = param {
                        // Equal-TS merges keep the greater key so both
                        // sides converge without a tiebreak round.
                        if self.key.as_deref().is_none_or(|cur| k > cur) || setter_ts < self.ts {
                            self.key = Some(k.to_string());
                        }
                    }
                } else {
                    self.key = None;
                }
            }
            'l' => {
                if adding {
                    if let Some(n) = param.and_then(|p| p.parse::<u32>().ok()) {
                        // Higher limit wins a merge.
                        if self.limit.is_none_or(|cur| n > cur) || setter_ts < self.ts {
                            self.limit = Some(n);
                        }
                    }
                } else {
                    self.limit = None;
                }
            }
            c if Self::is_simple_mode(c) => {
                if adding {
                    self.simple_modes.insert(c);
                } else {
                    self.simple_modes.remove(&c);
                }
            }
            c if Self::is_list_mode(c) => {
                if let Some(mask) = param {
                    if adding {
                        self.add_list_entry(
                            c,
                            ListModeEntry {
                                mask: mask.to_string(),
                                setter: String::new(),
                                set_ts: setter_ts,
                            },
                        );
                    } else if let Some(list) = self.list_modes.get_mut(&c) {
                        list.retain(|e| !e.mask.eq_ignore_ascii_case(mask));
                    }
                }
            }
            c if prefix_rank(c) > 0 => {
                let Some(target) = param.and_then(|p| p.parse::<Uid>().ok()) else {
                    return;
                };
                if let Some(memb) = self.members.get_mut(&target) {
                    if adding {
                        memb.add_prefix(c);
                    } else {
                        memb.remove_prefix(c);
                    }
                }
            }
            _ => {}
        }
    }

    /// The `+modes [params…]` representation of the channel's simple
    /// and parameterized modes, for FJOIN.
    pub fn mode_string(&self) -> Vec<String> {
        let mut letters = String::from("+");
        let mut params = Vec::new();
        for c in &self.simple_modes {
            letters.push(*c);
        }
        if let Some(ref key) = self.key {
            letters.push('k');
            params.push(key.clone());
        }
        if let Some(limit) = self.limit {
            letters.push('l');
            params.push(limit.to_string());
        }
        let mut out = vec![letters];
        out.extend(params);
        out
    }
}

/// Accumulates mode changes so a whole merge announces as one batch.
#[derive(Debug, Default)]
pub struct ModeStack {
    changes: Vec<(bool, char, Option<String>)>,
}

impl ModeStack {
    pub fn push(&mut self, adding: bool, letter: char, param: Option<String>) {
        self.changes.push((adding, letter, param));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Serializes into parameter vectors (`modes p1 p2 …`), at most
    /// [`MAX_MODES`] changes per vector.
    pub fn finalize(self) -> Vec<Vec<String>> {
        let mut lines = Vec::new();
        for chunk in self.changes.chunks(MAX_MODES) {
            let mut modes = String::new();
            let mut params = Vec::new();
            let mut last_sign = None;
            for (adding, letter, param) in chunk {
                if last_sign != Some(*adding) {
                    modes.push(if *adding { '+' } else { '-' });
                    last_sign = Some(*adding);
                }
                modes.push(*letter);
                if let Some(p) = param {
                    params.push(p.clone());
                }
            }
            let mut line = vec![modes];
            line.extend(params);
            lines.push(line);
        }
        lines
    }
}

/// Expands a mode string plus parameters into per-letter changes.
/// `k`, list modes and status modes always consume a parameter;
/// `l` consumes one only when adding.
pub fn parse_mode_changes(modes: &str, params: &[String]) -> Vec<(bool, char, Option<String>)> {
    let mut out = Vec::new();
    let mut adding = true;
    let mut param_iter = params.iter();
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            letter => {
                let takes_param = letter == 'k'
                    || (letter == 'l' && adding)
                    || Channel::is_list_mode(letter)
                    || prefix_rank(letter) > 0;
                let param = if takes_param {
                    param_iter.next().cloned()
                } else {
                    None
                };
                out.push((adding, letter, param));
            }
        }
    }
    out
}

/// The channel registry, indexed case-insensitively.
#[derive(Debug, Default)]
pub struct ChanMap {
    by_name: HashMap<String, Channel>,
}

impl ChanMap {
    pub fn find(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(&name.to_lowercase())
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.by_name.get_mut(&name.to_lowercase())
    }

    /// Finds or creates a channel with the given initial TS.
    pub fn find_or_create(&mut self, name: &str, ts: u64) -> &mut Channel {
        self.by_name
            .entry(name.to_lowercase())
            .or_insert_with(|| Channel::new(name, ts))
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.by_name.remove(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.by_name.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.by_name.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Drops a member from every channel, returning emptied channels.
    pub fn quit_user(&mut self, uid: &Uid) -> Vec<String> {
        let mut emptied = Vec::new();
        for chan in self.by_name.values_mut() {
            chan.part(uid);
            if chan.members.is_empty() {
                emptied.push(chan.name.clone());
            }
        }
        for name in &emptied {
            self.by_name.remove(&name.to_lowercase());
        }
        emptied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> Uid {
        s.parse().unwrap()
    }

    #[test]
    fn membership_prefixes_sort_by_rank() {
        let mut memb = Membership::default();
        memb.add_prefix('v');
        memb.add_prefix('o');
        memb.add_prefix('v');
        assert_eq!(memb.prefixes, "ov");
        assert_eq!(memb.rank(), OP_VALUE);
    }

    #[test]
    fn strip_all_modes_stacks_every_removal() {
        let mut chan = Channel::new("#x", 2000);
        chan.simple_modes.insert('n');
        chan.simple_modes.insert('t');
        chan.key = Some("sekrit".into());
        chan.join(uid("001AAAAAA"), "o");
        chan.add_list_entry(
            'b',
            ListModeEntry {
                mask: "*!*@bad".into(),
                setter: "x".into(),
                set_ts: 1,
            },
        );
        let mut stack = ModeStack::default();
        chan.strip_all_modes(&mut stack);
        assert!(chan.simple_modes.is_empty());
        assert!(chan.key.is_none());
        assert!(chan.list_modes.is_empty());
        assert_eq!(chan.members[&uid("001AAAAAA")].prefixes, "");
        let lines = stack.finalize();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0][0], "-ntkbo");
        assert_eq!(lines[0][1..], ["sekrit", "*!*@bad", "001AAAAAA"]);
    }

    #[test]
    fn parse_mode_changes_assigns_params() {
        let changes = parse_mode_changes(
            "+ntk-o",
            &["key".to_string(), "001AAAAAA".to_string()],
        );
        assert_eq!(
            changes,
            vec![
                (true, 'n', None),
                (true, 't', None),
                (true, 'k', Some("key".to_string())),
                (false, 'o', Some("001AAAAAA".to_string())),
            ]
        );
    }

    #[test]
    fn limit_merge_keeps_higher_value() {
        let mut chan = Channel::new("#x", 1000);
        chan.apply_mode(true, 'l', Some("50"), 1000);
        chan.apply_mode(true, 'l', Some("20"), 1000);
        assert_eq!(chan.limit, Some(50));
        chan.apply_mode(true, 'l', Some("80"), 1000);
        assert_eq!(chan.limit, Some(80));
    }

    #[test]
    fn mode_stack_chunks_at_max_modes() {
        let mut stack = ModeStack::default();
        for _ in 0..(MAX_MODES + 5) {
            stack.push(false, 'b', Some("mask".into()));
        }
        let lines = stack.finalize();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0][0].len(), 1 + MAX_MODES);
    }

    #[test]
    fn quit_user_reaps_empty_channels() {
        let mut chans = ChanMap::default();
        chans.find_or_create("#a", 100).join(uid("001AAAAAA"), "");
        let c = chans.find_or_create("#b", 100);
        c.join(uid("001AAAAAA"), "");
        c.join(uid("001AAAAAB"), "");
        let emptied = chans.quit_user(&uid("001AAAAAA"));
        assert_eq!(emptied, vec!["#a".to_string()]);
        assert!(chans.find("#a").is_none());
        assert_eq!(chans.find("#b").unwrap().members.len(), 1);
    }
}
