//! Netsplits: recursive removal of a subtree after link loss, a
//! remote `SQUIT`, or a protocol violation, quitting every user the
//! split strands.

use arbor_proto::CmdBuilder;

use crate::router;
use crate::server::SharedState;
use crate::state::Network;
use crate::tree::{LinkId, ServerHandle};

/// What a split removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSummary {
    pub target_name: String,
    pub parent_name: String,
    pub servers_lost: usize,
    pub users_lost: usize,
    /// The uplink socket to close, when the split severed a direct
    /// link of ours.
    pub closed_link: Option<LinkId>,
}

/// Removes `target` and its whole subtree. Quit reasons follow the
/// `hidesplits` option: either the literal `<parent> <target>` names
/// or the masked `*.net *.split`. The removal is propagated as SQUIT
/// to every peer except `origin`.
pub fn squit(
    state: &SharedState,
    net: &mut Network,
    target: ServerHandle,
    reason: &str,
    origin: Option<LinkId>,
) -> Option<SplitSummary> {
    let node = net.tree.get_live(target)?;
    if node.is_root() {
        return None;
    }
    let target_name = node.name.clone();
    let target_sid = node.sid;
    let parent_name = node
        .parent
        .and_then(|p| net.tree.get(p))
        .map(|p| p.name.clone())
        .unwrap_or_default();
    let direct_link = node.link;

    // Tell the rest of the network before the tree forgets the route.
    let line = CmdBuilder::new(net.sid().to_string(), "SQUIT")
        .push(target_sid.to_string())
        .push_last(reason)
        .finalize();
    router::broadcast(state, net, origin.or(direct_link), &line);

    let removed = net.tree.remove_server(target);
    let quit_reason = if state.config.network.options.hidesplits {
        "*.net *.split".to_string()
    } else {
        format!("{parent_name} {target_name}")
    };
    let quit = net.quit_users_on_dead_servers(&quit_reason);

    // Split events, deepest servers included.
    for &handle in &removed {
        if let Some(node) = net.tree.get(handle) {
            tracing::info!(server = %node.name, sid = %node.sid, reason, "server split from the network");
        }
    }
    tracing::warn!(
        target = %target_name,
        parent = %parent_name,
        servers_lost = removed.len(),
        users_lost = quit.len(),
        reason,
        "netsplit"
    );

    if let Some(link) = direct_link {
        if let Some(handle) = state.link(link) {
            handle.shutdown.notify_one();
        }
    }

    Some(SplitSummary {
        target_name,
        parent_name,
        servers_lost: removed.len(),
        users_lost: quit.len(),
        closed_link: direct_link,
    })
}

/// Handles the loss of a direct link: splits the peer's subtree, if
/// the handshake had gotten far enough to create one.
pub fn on_link_lost(state: &SharedState, net: &mut Network, link: LinkId, reason: &str) {
    if let Some(peer) = net.tree.find_by_link(link) {
        squit(state, net, peer, reason, Some(link));
    }
    net.tree.flush_culls();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::SharedState;
    use arbor_proto::Uid;

    fn state() -> std::sync::Arc<SharedState> {
        SharedState::new(ServerConfig::default()).unwrap()
    }

    fn add_remote_user(net: &mut Network, uid: &str, nick: &str) {
        let uid: Uid = uid.parse().unwrap();
        net.users.insert(crate::state::user::User {
            uid: uid.clone(),
            nick: nick.into(),
            nick_ts: 100,
            ident: "i".into(),
            host: "h".into(),
            dhost: "h".into(),
            ip: "10.0.0.9".into(),
            signon: 100,
            modes: String::new(),
            realname: nick.into(),
            oper: None,
            away: None,
            metadata: Default::default(),
        });
    }

    #[test]
    fn squit_cascades_through_the_subtree() {
        let state = state();
        let mut net = state.net.lock();
        // a ── b ── c ── d
        let root = net.tree.root();
        let b = net
            .tree
            .add_server(root, "b.example.net", "002".parse().unwrap(), "b", false, Some(1))
            .unwrap();
        let c = net
            .tree
            .add_server(b, "c.example.net", "003".parse().unwrap(), "c", false, None)
            .unwrap();
        net.tree
            .add_server(c, "d.example.net", "004".parse().unwrap(), "d", false, None)
            .unwrap();
        add_remote_user(&mut net, "003AAAAAA", "carol");
        add_remote_user(&mut net, "004AAAAAA", "dave");
        net.add_local_user("alice", "a", "h", "10.0.0.1", 100);

        let summary = squit(&state, &mut net, b, "link broken", None).unwrap();
        assert_eq!(summary.servers_lost, 3);
        assert_eq!(summary.users_lost, 2);
        assert_eq!(summary.closed_link, Some(1));
        assert_eq!(summary.parent_name, "a.example.net");
        net.tree.flush_culls();
        assert_eq!(net.tree.len(), 1);
        assert!(net.users.find_by_nick("alice").is_some());
        assert!(net.users.find_by_nick("carol").is_none());
        net.tree.check_invariants().unwrap();
    }

    #[test]
    fn squit_of_the_root_is_refused() {
        let state = state();
        let mut net = state.net.lock();
        let root = net.tree.root();
        assert!(squit(&state, &mut net, root, "no", None).is_none());
    }
}
