//! Timestamp rules for nickname collisions.
//!
//! When two users claim one nickname across a link, the loser is
//! forced onto their UUID with SAVE rather than killed. The rules:
//! same ident@ip means the older timestamp loses (a reconnecting
//! client races itself); different ident@ip means the newer loses
//! (someone sniped the nick during a split). Equal timestamps force
//! both sides.

/// Who has to give up the nickname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollideOutcome {
    /// Equal timestamps: force both to UUID.
    BothLose,
    /// The incoming remote user is renamed; our side keeps the nick.
    RemoteLoses,
    /// Our existing user is renamed; the remote keeps the nick.
    LocalLoses,
}

/// The identity half of the rule: ident and IP both equal.
pub fn same_identity(
    local_ident: &str,
    local_ip: &str,
    remote_ident: &str,
    remote_ip: &str,
) -> bool {
    local_ident == remote_ident && local_ip == remote_ip
}

/// Applies the collision rules.
pub fn resolve(
    local_ts: u64,
    local_ident: &str,
    local_ip: &str,
    remote_ts: u64,
    remote_ident: &str,
    remote_ip: &str,
) -> CollideOutcome {
    if remote_ts == local_ts {
        return CollideOutcome::BothLose;
    }
    let same = same_identity(local_ident, local_ip, remote_ident, remote_ip);
    // Same person with an older remote TS, or a different person with
    // a newer remote TS: the remote side changes.
    if (same && remote_ts < local_ts) || (!same && remote_ts > local_ts) {
        CollideOutcome::RemoteLoses
    } else {
        CollideOutcome::LocalLoses
    }
}
