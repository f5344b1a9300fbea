//! Network-wide ban lines (G/Z/Q/E), with the set-time conflict rule
//! applied when two sides of a split disagree.

use std::collections::HashMap;

/// One ban line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLine {
    /// Type code: `G`, `Z`, `Q`, `E`, or a module-defined name.
    pub kind: String,
    pub mask: String,
    pub setter: String,
    pub reason: String,
    pub set_ts: u64,
    /// Seconds; zero is permanent.
    pub duration: u64,
}

impl XLine {
    /// Expiry timestamp; `None` for permanent lines.
    pub fn expiry(&self) -> Option<u64> {
        (self.duration > 0).then(|| self.set_ts + self.duration)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry().is_some_and(|at| at <= now)
    }
}

/// What happened when a line was offered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddLineResult {
    Added,
    /// An overlapping entry with an older set-time already exists.
    OlderWins,
    Expired,
}

/// Per-type indexed ban registry. Only the types named in
/// `BURSTABLE_TYPES` replicate; `K` and friends stay local.
#[derive(Debug, Default)]
pub struct XLineManager {
    /// type -> lowercase mask -> line
    lines: HashMap<String, HashMap<String, XLine>>,
}

const BURSTABLE_TYPES: &[&str] = &["G", "Z", "Q", "E"];

pub fn is_burstable(kind: &str) -> bool {
    BURSTABLE_TYPES.contains(&kind)
}

impl XLineManager {
    /// Applies the conflict rule and inserts. The lower set-time wins
    /// an overlap; expired entries are refused outright.
    pub fn add(&mut self, line: XLine, now: u64) -> AddLineResult {
        if line.is_expired(now) {
            return AddLineResult::Expired;
        }
        let per_type = self.lines.entry(line.kind.clone()).or_default();
        let key = line.mask.to_lowercase();
        if let Some(existing) = per_type.get(&key) {
            if existing.set_ts <= line.set_ts && !existing.is_expired(now) {
                return AddLineResult::OlderWins;
            }
        }
        per_type.insert(key, line);
        AddLineResult::Added
    }

    /// Removes a line by type and mask. Returns it if present.
    pub fn remove(&mut self, kind: &str, mask: &str) -> Option<XLine> {
        self.lines.get_mut(kind)?.remove(&mask.to_lowercase())
    }

    pub fn find(&self, kind: &str, mask: &str) -> Option<&XLine> {
        self.lines.get(kind)?.get(&mask.to_lowercase())
    }

    /// Unexpired burstable lines, for the netburst. Deterministic
    /// order: by type, then mask.
    pub fn burstable(&self, now: u64) -> Vec<&XLine> {
        let mut out: Vec<&XLine> = self
            .lines
            .iter()
            .filter(|(kind, _)| is_burstable(kind))
            .flat_map(|(_, per_type)| per_type.values())
            .filter(|l| !l.is_expired(now))
            .collect();
        out.sort_by(|a, b| (&a.kind, &a.mask).cmp(&(&b.kind, &b.mask)));
        out
    }

    /// Drops expired entries.
    pub fn expire(&mut self, now: u64) {
        for per_type in self.lines.values_mut() {
            per_type.retain(|_, l| !l.is_expired(now));
        }
    }

    pub fn len(&self) -> usize {
        self.lines.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gline(mask: &str, set_ts: u64, duration: u64) -> XLine {
        XLine {
            kind: "G".into(),
            mask: mask.into(),
            setter: "oper".into(),
            reason: "spam".into(),
            set_ts,
            duration,
        }
    }

    #[test]
    fn lower_set_time_wins_overlap() {
        let mut mgr = XLineManager::default();
        assert_eq!(mgr.add(gline("*@bad.example", 100, 0), 150), AddLineResult::Added);
        assert_eq!(
            mgr.add(gline("*@bad.example", 200, 0), 250),
            AddLineResult::OlderWins
        );
        assert_eq!(mgr.find("G", "*@BAD.example").unwrap().set_ts, 100);
        assert_eq!(mgr.add(gline("*@bad.example", 50, 0), 250), AddLineResult::Added);
        assert_eq!(mgr.find("G", "*@bad.example").unwrap().set_ts, 50);
    }

    #[test]
    fn expired_lines_do_not_replicate() {
        let mut mgr = XLineManager::default();
        assert_eq!(mgr.add(gline("*@old.example", 100, 10), 500), AddLineResult::Expired);
        mgr.add(gline("*@live.example", 490, 100), 500);
        mgr.add(gline("*@dying.example", 100, 200), 150);
        assert_eq!(mgr.burstable(500).len(), 1);
    }

    #[test]
    fn non_burstable_types_stay_local() {
        let mut mgr = XLineManager::default();
        mgr.add(
            XLine {
                kind: "K".into(),
                mask: "*@local.example".into(),
                setter: "oper".into(),
                reason: "local only".into(),
                set_ts: 100,
                duration: 0,
            },
            100,
        );
        assert!(mgr.burstable(100).is_empty());
        assert!(mgr.find("K", "*@local.example").is_some());
    }
}
