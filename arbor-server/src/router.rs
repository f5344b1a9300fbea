//! The routing fabric: given an executed command and its routing
//! descriptor, forward it to the right set of peers, wrapping the
//! optional forms in ENCAP so servers that lack the verb still pass
//! it along.

use arbor_proto::CmdBuilder;

use crate::server::SharedState;
use crate::state::Network;
use crate::state::channel::prefix_rank;
use crate::tree::{LinkId, ServerHandle};

/// Where a command goes after local execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Not propagated.
    Local,
    /// Every direct peer (except the one it came from).
    Broadcast,
    /// Broadcast, wrapped as `ENCAP *`.
    OptBroadcast,
    /// Toward one server (name, SID, nick or UUID).
    Unicast(String),
    /// Unicast wrapped as `ENCAP <dest-sid>`.
    OptUnicast(String),
    /// A message target: channel, `$`-mask or nick. For channels an
    /// optional minimum status rank filters recipients.
    Message(String),
}

/// Forwards one already-executed command.
pub fn route(
    state: &SharedState,
    net: &Network,
    origin: Option<LinkId>,
    source: &str,
    command: &str,
    params: &[String],
    routing: &Routing,
) {
    match routing {
        Routing::Local => {}
        Routing::Broadcast => {
            let line = build_line(source, command, params);
            broadcast(state, net, origin, &line);
        }
        Routing::OptBroadcast => {
            let line = encap_line(source, "*", command, params);
            broadcast(state, net, origin, &line);
        }
        Routing::Unicast(target) => {
            if let Some(line_target) = resolve_link(net, target, origin) {
                let line = build_line(source, command, params);
                state.send_to_link(line_target, line);
            }
        }
        Routing::OptUnicast(target) => {
            let Some(dest) = net.find_route_target(target) else {
                return;
            };
            let Some(dest_sid) = net.tree.get_live(dest).map(|n| n.sid.to_string()) else {
                return;
            };
            if let Some(link) = link_for(net, dest, origin) {
                let line = encap_line(source, &dest_sid, command, params);
                state.send_to_link(link, line);
            }
        }
        Routing::Message(target) => route_message(state, net, origin, source, command, params, target),
    }
}

fn route_message(
    state: &SharedState,
    net: &Network,
    origin: Option<LinkId>,
    source: &str,
    command: &str,
    params: &[String],
    target: &str,
) {
    if let Some(mask) = target.strip_prefix('$') {
        let _ = mask;
        let line = build_line(source, command, params);
        broadcast(state, net, origin, &line);
        return;
    }
    // A status prefix narrows a channel message to members holding at
    // least that rank (`@#chan`, `%#chan`, `+#chan`).
    let (min_rank, bare) = match target.chars().next() {
        Some('@') => (prefix_rank('o'), &target[1..]),
        Some('%') => (prefix_rank('h'), &target[1..]),
        Some('+') => (prefix_rank('v'), &target[1..]),
        _ => (0, target),
    };
    if bare.starts_with('#') {
        let line = build_line(source, command, params);
        for link in channel_links(net, bare, min_rank, origin) {
            state.send_to_link(link, line.clone());
        }
        return;
    }
    if let Some(link) = resolve_link(net, target, origin) {
        let line = build_line(source, command, params);
        state.send_to_link(link, line);
    }
}

/// The links leading to every server with at least one member of
/// `channel` at or above `min_rank`, excluding the origin edge.
pub fn channel_links(
    net: &Network,
    channel: &str,
    min_rank: u32,
    origin: Option<LinkId>,
) -> Vec<LinkId> {
    let mut links = Vec::new();
    let Some(chan) = net.chans.find(channel) else {
        return links;
    };
    for (uid, memb) in &chan.members {
        if min_rank > 0 && memb.rank() < min_rank {
            continue;
        }
        let Some(server) = net.tree.find_by_sid(uid.sid()) else {
            continue;
        };
        if server == net.tree.root() {
            continue;
        }
        if let Some(link) = net.tree.link_to(server) {
            if Some(link) != origin && !links.contains(&link) {
                links.push(link);
            }
        }
    }
    links.sort_unstable();
    links
}

/// Sends a line to every direct peer except the origin edge.
pub fn broadcast(state: &SharedState, net: &Network, origin: Option<LinkId>, line: &str) {
    let Some(root) = net.tree.get(net.tree.root()) else {
        return;
    };
    for &child in &root.children {
        let Some(link) = net.tree.get_live(child).and_then(|n| n.link) else {
            continue;
        };
        if Some(link) != origin {
            state.send_to_link(link, line.to_string());
        }
    }
}

/// Resolves a target to the link it should leave on. Never routes
/// back along the origin edge.
fn resolve_link(net: &Network, target: &str, origin: Option<LinkId>) -> Option<LinkId> {
    let dest = net.find_route_target(target)?;
    link_for(net, dest, origin)
}

fn link_for(net: &Network, dest: ServerHandle, origin: Option<LinkId>) -> Option<LinkId> {
    if dest == net.tree.root() {
        return None;
    }
    let link = net.tree.link_to(dest)?;
    (Some(link) != origin).then_some(link)
}

fn build_line(source: &str, command: &str, params: &[String]) -> String {
    let mut builder = CmdBuilder::new(source, command);
    for p in params {
        builder = builder.push(p.clone());
    }
    builder.finalize()
}

/// Wraps a command as `:<source> ENCAP <dest> CMD params…`.
fn encap_line(source: &str, dest: &str, command: &str, params: &[String]) -> String {
    let mut builder = CmdBuilder::new(source, "ENCAP").push(dest).push(command);
    for p in params {
        builder = builder.push(p.clone());
    }
    builder.finalize()
}

/// True when a command claiming to come from `claimed` may arrive on
/// `via`: the claimed source must be reachable through that exact
/// link. Anything else is a spoof or a desync.
pub fn direction_ok(net: &Network, claimed: ServerHandle, via: LinkId) -> bool {
    net.tree.link_to(claimed) == Some(via)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Network;

    fn network_with_two_links() -> (Network, ServerHandle, ServerHandle) {
        let mut net = Network::new("a.example.net", "001".parse().unwrap(), "a");
        let b = net
            .tree
            .add_server(net.tree.root(), "b.example.net", "002".parse().unwrap(), "b", false, Some(10))
            .unwrap();
        let c = net
            .tree
            .add_server(net.tree.root(), "c.example.net", "003".parse().unwrap(), "c", false, Some(20))
            .unwrap();
        (net, b, c)
    }

    #[test]
    fn direction_check_rejects_wrong_edge() {
        let (net, b, c) = network_with_two_links();
        assert!(direction_ok(&net, b, 10));
        assert!(!direction_ok(&net, b, 20));
        assert!(direction_ok(&net, c, 20));
    }

    #[test]
    fn channel_links_deduplicate_and_respect_rank() {
        let (mut net, _, _) = network_with_two_links();
        let chan = net.chans.find_or_create("#x", 100);
        chan.join("002AAAAAA".parse().unwrap(), "o");
        chan.join("002AAAAAB".parse().unwrap(), "");
        chan.join("003AAAAAA".parse().unwrap(), "v");
        // Everyone: both links, each once.
        assert_eq!(channel_links(&net, "#x", 0, None), vec![10, 20]);
        // Ops only: just the link with the op.
        assert_eq!(
            channel_links(&net, "#x", prefix_rank('o'), None),
            vec![10]
        );
        // Never back along the origin edge.
        assert_eq!(channel_links(&net, "#x", 0, Some(10)), vec![20]);
    }
}
