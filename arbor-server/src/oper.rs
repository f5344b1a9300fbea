//! Operator-facing views and actions on the tree: MAP, LINKS,
//! CONNECT and SQUIT. The client-side command plumbing lives outside
//! this crate; these entry points do the spanning-tree half.

use std::sync::Arc;

use crate::config::Options;
use crate::link;
use crate::netsplit::{self, SplitSummary};
use crate::server::SharedState;
use crate::state::Network;
use crate::tree::ServerHandle;
use crate::util::wildcard_match;

/// Renders the network map: indented tree, user counts and shares,
/// SIDs and latency for opers. Hidden and service servers are
/// suppressed for non-opers, and `flatlinks` removes the indentation.
pub fn map_lines(net: &Network, opts: &Options, oper: bool) -> Vec<String> {
    let total_users = net.users.len().max(1);
    let mut rows: Vec<(String, String)> = Vec::new();
    render_map(net, net.tree.root(), 0, opts, oper, total_users, &mut rows);
    let name_width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    let mut out: Vec<String> = rows
        .into_iter()
        .map(|(name, stat)| format!("{name:<name_width$} {stat}"))
        .collect();
    let servers = net.tree.len();
    out.push(format!(
        "{} server{} and {} user{}, average {:.2} users per server",
        servers,
        if servers == 1 { "" } else { "s" },
        net.users.len(),
        if net.users.len() == 1 { "" } else { "s" },
        net.users.len() as f64 / servers as f64
    ));
    out
}

fn render_map(
    net: &Network,
    current: ServerHandle,
    depth: usize,
    opts: &Options,
    oper: bool,
    total_users: usize,
    rows: &mut Vec<(String, String)>,
) {
    let Some(node) = net.tree.get_live(current) else {
        return;
    };
    let mut name = String::new();
    for _ in 0..depth {
        name.push(' ');
    }
    if depth > 0 {
        name.push_str("`- ");
    }
    name.push_str(&node.name);
    if oper {
        name.push_str(&format!(" ({})", node.sid));
    }
    let percent = node.user_count as f64 * 100.0 / total_users as f64;
    let mut stat = format!("{:5} [{percent:5.2}%]", node.user_count);
    if oper && !node.is_root() {
        stat.push_str(&format!(" [{} ms]", node.rtt_ms));
    }
    rows.push((name, stat));

    let next_depth = if oper || !opts.flatlinks { depth + 2 } else { depth };
    for &child in &node.children {
        if !oper {
            let Some(child_node) = net.tree.get_live(child) else {
                continue;
            };
            if child_node.hidden {
                continue;
            }
            if opts.hideservices && child_node.service {
                continue;
            }
        }
        render_map(net, child, next_depth, opts, oper, total_users, rows);
    }
}

/// Renders LINKS: `<name> <parent> :<hops> <description>` rows,
/// deepest first, with the same visibility rules as MAP.
pub fn links_lines(net: &Network, opts: &Options, oper: bool) -> Vec<String> {
    let mut out = Vec::new();
    for handle in net.tree.dfs_order(None) {
        let Some(node) = net.tree.get_live(handle) else {
            continue;
        };
        if !oper && (node.hidden || (opts.hideservices && node.service)) {
            continue;
        }
        let (parent_name, hops) = if oper && !opts.flatlinks {
            let parent = node
                .parent
                .and_then(|p| net.tree.get(p))
                .map(|p| p.name.clone())
                .unwrap_or_else(|| node.name.clone());
            (parent, depth_of(net, handle))
        } else {
            // Non-opers (and flatlinks) see a flat star around us.
            let root = net.tree.get(net.tree.root()).map(|n| n.name.clone()).unwrap_or_default();
            (root, usize::from(!node.is_root()))
        };
        out.push(format!("{} {} :{} {}", node.name, parent_name, hops, node.description));
    }
    out
}

fn depth_of(net: &Network, mut handle: ServerHandle) -> usize {
    let mut depth = 0;
    while let Some(parent) = net.tree.get(handle).and_then(|n| n.parent) {
        depth += 1;
        handle = parent;
    }
    depth
}

/// `CONNECT <mask>`: dials the first link block matching the mask.
/// Returns a status line for the oper.
pub fn connect(state: &Arc<SharedState>, mask: &str) -> String {
    let Some(block) = state
        .config
        .network
        .link
        .iter()
        .find(|l| wildcard_match(mask, &l.name))
    else {
        return format!("*** CONNECT: No server matching \x02{mask}\x02 could be found in the config file.");
    };
    let name = block.name.clone();
    if block.ipaddr.is_none() || block.port.is_none() {
        return format!("*** CONNECT: Server \x02{name}\x02 has no address to connect to.");
    }
    {
        let net = state.net.lock();
        if net.tree.find_by_name(&name).is_some() {
            return format!("*** CONNECT: Server \x02{name}\x02 already exists on the network and is connected via a different route.");
        }
    }
    let state = Arc::clone(state);
    let spawned_name = name.clone();
    tokio::spawn(async move {
        if let Err(err) = link::connect_to(state, &spawned_name).await {
            tracing::warn!(link = %spawned_name, "CONNECT failed: {err:#}");
        }
    });
    format!("*** CONNECT: Connecting to \x02{name}\x02.")
}

/// `SQUIT <mask>`: splits a directly connected server. Anything
/// further away needs RSQUIT on its parent.
pub fn squit_mask(
    state: &Arc<SharedState>,
    net: &mut Network,
    mask: &str,
    reason: &str,
) -> Result<SplitSummary, String> {
    let Some(target) = net.tree.find_by_mask(mask) else {
        return Err(format!("*** SQUIT: The server \x02{mask}\x02 does not exist on the network."));
    };
    if target == net.tree.root() {
        return Err("*** SQUIT: You cannot disconnect your own server.".to_string());
    }
    let direct = net.tree.get(target).and_then(|n| n.parent) == Some(net.tree.root());
    if !direct {
        return Err(format!(
            "*** SQUIT: The server \x02{mask}\x02 is not directly connected; use RSQUIT on its uplink."
        ));
    }
    netsplit::squit(state, net, target, reason, None)
        .ok_or_else(|| "*** SQUIT: Split failed.".to_string())
}
