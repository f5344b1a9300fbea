//! Server-to-server control commands: remote server introduction,
//! splits, pings, burst delimiters, version info, encapsulation and
//! the remotely-routed operator commands.

use arbor_proto::{CmdBuilder, Message, Sid, Uid};

use crate::error::{CmdResult, ProtocolViolation};
use crate::link;
use crate::netsplit;
use crate::router;
use crate::util::{now_secs, wildcard_match};

use super::{Ctx, Source, find_command};

/// `SERVER <name> <sid> [<key>=<value>…] :<desc>` — a peer introduces
/// a server behind it. A duplicate name or SID refuses the subtree
/// with a SQUIT back at the introducer rather than killing the link.
pub fn handle_server(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::Server(parent) = source else {
        unreachable!("dispatcher enforces a server source");
    };
    let name = msg.params[0].clone();
    let sid_str = msg.params[1].clone();
    let desc = msg.params.last().cloned().unwrap_or_default();
    if !arbor_proto::valid_server_name(&name) {
        return Err(ProtocolViolation::new(format!("Invalid servername: {name}")));
    }
    let sid: Sid = sid_str
        .parse()
        .map_err(|_| ProtocolViolation::new(format!("Invalid SID: {sid_str}")))?;

    let mut burst_start = None;
    let mut hidden = false;
    for prop in &msg.params[2..msg.params.len().saturating_sub(1)] {
        match prop.split_once('=') {
            Some(("burst", ms)) => burst_start = Some(ms.parse::<u64>().unwrap_or(0)),
            Some(("hidden", flag)) => hidden = flag == "1",
            _ => {}
        }
    }

    if ctx.net.tree.find_by_name(&name).is_some() || ctx.net.tree.find_by_sid(sid).is_some() {
        // The network already has this identity; refuse the subtree
        // without dropping an otherwise healthy link.
        tracing::warn!(server = %name, sid = %sid, "duplicate server introduction refused");
        let line = CmdBuilder::new(ctx.our_sid(), "SQUIT")
            .push(sid_str)
            .push_last("Server already exists on the network")
            .finalize();
        ctx.state.send_to_link(ctx.link, line);
        return Ok(CmdResult::Failure);
    }

    let handle = ctx
        .net
        .tree
        .add_server(*parent, &name, sid, &desc, hidden, None)
        .map_err(|e| ProtocolViolation::new(e.to_string()))?;
    if let Some(node) = ctx.net.tree.get_mut(handle) {
        node.service = ctx.state.config.network.is_service(&name);
        node.silent_service = ctx.state.config.network.is_silent_service(&name);
    }
    if let Some(ms) = burst_start {
        ctx.net.tree.begin_burst(handle, ms);
    }
    if !ctx.quiet(*parent) {
        tracing::info!(server = %name, sid = %sid, "server joined the network");
    }
    Ok(CmdResult::Success)
}

/// `SQUIT <sid|name> :<reason>` — remove a subtree. A remote sender
/// may only split servers inside its own subtree; targeting us turns
/// into a drop of the link it came over.
pub fn handle_squit(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let reason = msg.params.get(1).cloned().unwrap_or_default();
    let Some(mut target) = ctx.net.find_route_target(&msg.params[0]) else {
        // Raced with another split.
        return Ok(CmdResult::Failure);
    };
    if target == ctx.net.tree.root() {
        // They want rid of us; sever the edge it was asked over.
        target = ctx.peer;
    }
    if !router::direction_ok(ctx.net, target, ctx.link) {
        return Err(ProtocolViolation::new(format!(
            "SQUIT of {} which is not downstream of this link",
            msg.params[0]
        )));
    }
    let is_user_source = matches!(source, Source::User(_));
    if is_user_source {
        tracing::info!(target = %msg.params[0], reason = %reason, "remote oper SQUIT");
    }
    netsplit::squit(ctx.state, ctx.net, target, &reason, Some(ctx.link));
    Ok(CmdResult::Success)
}

/// `PING <dest-sid>` — answered when addressed to us, routed onward
/// otherwise.
pub fn handle_ping(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let dest = &msg.params[0];
    if *dest == ctx.state.config.sid || dest.eq_ignore_ascii_case(&ctx.state.config.server_name) {
        let requester = source.prefix(ctx.net);
        let line = CmdBuilder::new(ctx.our_sid(), "PONG").push(requester).finalize();
        ctx.state.send_to_link(ctx.link, line);
        return Ok(CmdResult::Failure);
    }
    Ok(CmdResult::Success)
}

/// `PONG <dest-sid>` — closes our ping cycle (handled on the link
/// task), with one legacy quirk: a peer that answers a ping while we
/// still think it is bursting is taken to have finished its burst.
pub fn handle_pong(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let dest = &msg.params[0];
    if *dest == ctx.state.config.sid || dest.eq_ignore_ascii_case(&ctx.state.config.server_name) {
        if let Source::Server(server) = source {
            let bursting = ctx.net.tree.get(*server).is_some_and(|n| n.is_bursting());
            if bursting {
                let name = ctx
                    .net
                    .tree
                    .get(*server)
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                tracing::warn!(
                    server = %name,
                    "PONG while bursting taken as an implicit ENDBURST (legacy peer); state may be incomplete"
                );
                ctx.net.tree.finish_burst(*server);
            }
        }
        return Ok(CmdResult::Failure);
    }
    Ok(CmdResult::Success)
}

/// `BURST [<wall-secs>]` — the peer starts replaying its state.
pub fn handle_burst(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::Server(server) = source else {
        unreachable!("dispatcher enforces a server source");
    };
    let their_secs = msg
        .params
        .first()
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(0);
    if their_secs > 0 {
        link::check_clock_skew(their_secs, now_secs())?;
    }
    ctx.net.tree.begin_burst(*server, their_secs * 1000);
    Ok(CmdResult::Success)
}

/// `ENDBURST` — the source server finished replaying.
pub fn handle_endburst(
    ctx: &mut Ctx,
    source: &Source,
    _msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::Server(server) = source else {
        unreachable!("dispatcher enforces a server source");
    };
    let elapsed = ctx.net.tree.finish_burst(*server);
    if let Some(node) = ctx.net.tree.get(*server) {
        let direct = node.parent == Some(ctx.net.tree.root());
        tracing::info!(
            server = %node.name,
            burst_ms = elapsed,
            snomask = if direct { "l" } else { "L" },
            "received end of netburst"
        );
    }
    ctx.net.xlines.expire(now_secs());
    Ok(CmdResult::Success)
}

/// `SINFO <key> :<value>` — server version metadata, including the
/// denormalized legacy keys older peers send.
pub fn handle_sinfo(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::Server(server) = source else {
        unreachable!("dispatcher enforces a server source");
    };
    let key = msg.params[0].to_ascii_lowercase();
    let value = msg.params.last().cloned().unwrap_or_default();
    let sid = ctx.net.tree.get(*server).map(|n| n.sid);
    let Some(node) = ctx.net.tree.get_mut(*server) else {
        return Ok(CmdResult::Failure);
    };
    match key.as_str() {
        "customversion" => node.customversion = value,
        "rawbranch" => node.rawbranch = value,
        "rawversion" => node.rawversion = value,
        "desc" => {
            tracing::debug!(server = %node.name, desc = %value, "server description changed");
            node.description = value;
        }
        // Deprecated: "<version>. <server> :[<sid>] <custom>"
        "fullversion" => {
            let mut words = value.split_whitespace();
            if let Some(raw) = words.next() {
                node.rawversion = raw.trim_end_matches('.').to_string();
            }
            let custom = legacy_trailing(words.skip(1));
            let custom = match sid {
                Some(sid) => custom
                    .strip_prefix(&format!("[{sid}] "))
                    .map(str::to_string)
                    .unwrap_or(custom),
                None => custom,
            };
            node.customversion = custom;
        }
        // Deprecated: "<branch>. <server> :<custom>"
        "version" => {
            let mut words = value.split_whitespace();
            if let Some(raw) = words.next() {
                node.rawbranch = raw.trim_end_matches('.').to_string();
            }
            node.customversion = legacy_trailing(words.skip(1));
        }
        _ => {}
    }
    Ok(CmdResult::Success)
}

/// Rejoins the tail of a denormalized legacy SINFO value, which
/// embedded a whole VERSION reply including its colon.
fn legacy_trailing<'a>(words: impl Iterator<Item = &'a str>) -> String {
    let joined = words.collect::<Vec<_>>().join(" ");
    joined.strip_prefix(':').map(str::to_string).unwrap_or(joined)
}

/// `ENCAP <target> <verb> [<args>…]` — execute the inner verb when
/// the target matches us; forward regardless, so peers that know the
/// verb still see it even when we do not.
pub fn handle_encap(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target = msg.params[0].clone();
    let ours = ctx.state.config.sid.clone();
    let matches_us = target == "*" || wildcard_match(&target, &ours);

    if matches_us {
        let verb = msg.params[1].to_ascii_uppercase();
        match find_command(&verb) {
            Some(def) => {
                let mut inner = Message {
                    tags: msg.tags.clone(),
                    source: msg.source.clone(),
                    command: verb,
                    params: msg.params[2..].to_vec(),
                };
                if inner.params.len() < def.min_params {
                    tracing::debug!(verb = %inner.command, "encapsulated command with too few parameters, skipped");
                } else {
                    let ok_source = match (def.source, source) {
                        (super::SourceKind::User, Source::Server(_))
                        | (super::SourceKind::Server, Source::User(_)) => false,
                        _ => true,
                    };
                    if ok_source {
                        (def.handler)(ctx, source, &mut inner)?;
                    }
                }
            }
            None => {
                tracing::debug!(verb = %msg.params[1], "unknown encapsulated verb, forwarding anyway");
            }
        }
    }

    // Forward toward the matching peers ourselves; targets can be
    // masks, which plain unicast routing does not understand.
    let prefix = source.prefix(ctx.net);
    let mut builder = CmdBuilder::new(prefix, "ENCAP");
    for p in &msg.params {
        builder = builder.push(p.clone());
    }
    let line = builder.finalize();
    if target == "*" || target.contains(['*', '?']) {
        router::broadcast(ctx.state, ctx.net, Some(ctx.link), &line);
    } else if let Some(dest) = ctx.net.find_route_target(&target) {
        if dest != ctx.net.tree.root() {
            if let Some(out) = ctx.net.tree.link_to(dest) {
                if out != ctx.link {
                    ctx.state.send_to_link(out, line);
                }
            }
        }
    }
    Ok(CmdResult::Failure)
}

/// `NUM <origin-sid> <target-uuid> <numeric> [<params>…]` — a routed
/// numeric for a remote user.
pub fn handle_num(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Ok(target) = msg.params[1].parse::<Uid>() else {
        return Ok(CmdResult::Failure);
    };
    if target.sid() == ctx.net.sid() {
        // Ours; delivery to the client socket is the client layer's
        // concern.
        tracing::debug!(target = %target, numeric = %msg.params[2], "numeric arrived for local user");
        return Ok(CmdResult::Failure);
    }
    Ok(CmdResult::Success)
}

/// `PUSH <target> :<raw line>` — deliver a raw line to a user's
/// server.
pub fn handle_push(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Some(user) = ctx.net.users.find(&msg.params[0]) else {
        return Ok(CmdResult::Failure);
    };
    if user.server() == ctx.net.sid() {
        tracing::debug!(target = %user.uid, "PUSH arrived for local user");
        return Ok(CmdResult::Failure);
    }
    msg.params[0] = user.uid.to_string();
    Ok(CmdResult::Success)
}

/// `SNONOTICE <mask> :<text>` — a server notice relayed to opers with
/// the given snomask, surfaced here as a structured log event.
pub fn handle_snonotice(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let origin = source.prefix(ctx.net);
    tracing::info!(
        snomask = %msg.params[0],
        from = %origin,
        "{}",
        msg.params[1]
    );
    Ok(CmdResult::Success)
}

/// `RCONNECT <remote-mask> <target-mask>` — ask a remote server to
/// CONNECT somewhere.
pub fn handle_rconnect(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let remote_mask = msg.params[0].clone();
    if wildcard_match(&remote_mask, &ctx.state.config.server_name) {
        let target = msg.params[1].clone();
        tracing::info!(target = %target, "remote CONNECT request");
        let state = std::sync::Arc::clone(ctx.state);
        tokio::spawn(async move {
            if let Err(err) = link::connect_to(state, &target).await {
                tracing::warn!(link = %target, "remote CONNECT failed: {err:#}");
            }
        });
        return Ok(CmdResult::Failure);
    }
    forward_to_mask(ctx, source, "RCONNECT", &msg.params, &remote_mask);
    Ok(CmdResult::Failure)
}

/// `RSQUIT <target-mask> [:reason]` — ask the server above the target
/// to split it off.
pub fn handle_rsquit(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target_mask = msg.params[0].clone();
    let reason = msg.params.get(1).cloned().unwrap_or_else(|| "Remote SQUIT".to_string());
    let Some(target) = ctx.net.tree.find_by_mask(&target_mask) else {
        return Ok(CmdResult::Failure);
    };
    if ctx.net.tree.get(target).and_then(|n| n.parent) == Some(ctx.net.tree.root()) {
        // The target hangs off us; the split is ours to perform.
        netsplit::squit(ctx.state, ctx.net, target, &reason, None);
        return Ok(CmdResult::Failure);
    }
    forward_to_mask(ctx, source, "RSQUIT", &msg.params, &target_mask);
    Ok(CmdResult::Failure)
}

/// Forwards a command toward the first server matching a name mask,
/// never back along the arriving edge.
fn forward_to_mask(ctx: &mut Ctx, source: &Source, command: &str, params: &[String], mask: &str) {
    let Some(dest) = ctx.net.tree.find_by_mask(mask) else {
        return;
    };
    if dest == ctx.net.tree.root() {
        return;
    }
    let Some(out) = ctx.net.tree.link_to(dest) else {
        return;
    };
    if out == ctx.link {
        return;
    }
    let prefix = source.prefix(ctx.net);
    let mut builder = CmdBuilder::new(prefix, command);
    for p in params {
        builder = builder.push(p.clone());
    }
    ctx.state.send_to_link(out, builder.finalize());
}
