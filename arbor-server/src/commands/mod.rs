//! The server-command dispatcher: resolves the source of each decoded
//! line, enforces direction, dispatches by verb through a static
//! sorted table and hands successful commands to the router.
//!
//! Handlers are split by subject:
//! - [`users`] — UID, NICK, QUIT, KILL, SAVE, OPERTYPE, AWAY, IDLE
//! - [`channels`] — FJOIN, IJOIN, RESYNC, PART, KICK, FMODE, MODE,
//!   LMODE, FTOPIC, TOPIC, METADATA
//! - [`servers`] — SERVER, SQUIT, PING, PONG, BURST, ENDBURST, SINFO,
//!   ENCAP, NUM, PUSH, SNONOTICE, RCONNECT, RSQUIT
//! - [`xlines`] — ADDLINE, DELLINE

pub mod channels;
pub mod servers;
pub mod users;
pub mod xlines;

use std::sync::Arc;

use arbor_proto::{Message, Sid, Uid};

use crate::error::{CmdResult, ProtocolViolation};
use crate::router::{self, Routing};
use crate::server::SharedState;
use crate::state::Network;
use crate::tree::{LinkId, ServerHandle};

/// The resolved origin of a line.
#[derive(Debug, Clone)]
pub enum Source {
    Server(ServerHandle),
    User(Uid),
}

impl Source {
    /// The server a command from this source travels through.
    pub fn server(&self, net: &Network) -> Option<ServerHandle> {
        match self {
            Source::Server(handle) => Some(*handle),
            Source::User(uid) => net.tree.find_by_sid(uid.sid()),
        }
    }

    /// The canonical prefix string for re-emission.
    pub fn prefix(&self, net: &Network) -> String {
        match self {
            Source::Server(handle) => net
                .tree
                .get(*handle)
                .map(|n| n.sid.to_string())
                .unwrap_or_default(),
            Source::User(uid) => uid.to_string(),
        }
    }

    pub fn user<'n>(&self, net: &'n Network) -> Option<&'n crate::state::user::User> {
        match self {
            Source::User(uid) => net.users.find_by_uuid(uid),
            Source::Server(_) => None,
        }
    }
}

/// What kind of source a command accepts. The wrong kind aborts the
/// link: a server pretending to be a user (or vice versa) is never a
/// race, always a spoof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    User,
    Server,
    Any,
}

/// Handler context: the locked network plus where the line came from.
pub struct Ctx<'a> {
    pub state: &'a Arc<SharedState>,
    pub net: &'a mut Network,
    pub link: LinkId,
    /// The direct peer on the arriving link.
    pub peer: ServerHandle,
}

impl Ctx<'_> {
    /// Our own SID as a prefix string.
    pub fn our_sid(&self) -> String {
        self.net.sid().to_string()
    }

    /// True when oper-facing notices for `server` should be quieted
    /// because it is still behind a burst.
    pub fn quiet(&self, server: ServerHandle) -> bool {
        self.state.config.network.options.quietbursts
            && self
                .net
                .tree
                .get(server)
                .is_some_and(|n| n.is_bursting() || n.silent_service)
    }
}

pub type Handler = fn(&mut Ctx, &Source, &mut Message) -> Result<CmdResult, ProtocolViolation>;
pub type RoutingFn = fn(&Source, &[String]) -> Routing;

/// One entry in the verb table.
pub struct CommandDef {
    pub name: &'static str,
    pub min_params: usize,
    pub source: SourceKind,
    pub handler: Handler,
    pub routing: RoutingFn,
}

fn broadcast(_: &Source, _: &[String]) -> Routing {
    Routing::Broadcast
}

fn local(_: &Source, _: &[String]) -> Routing {
    Routing::Local
}

fn unicast_first(_: &Source, params: &[String]) -> Routing {
    match params.first() {
        Some(target) => Routing::Unicast(target.clone()),
        None => Routing::Local,
    }
}

fn message_first(_: &Source, params: &[String]) -> Routing {
    match params.first() {
        Some(target) => Routing::Message(target.clone()),
        None => Routing::Local,
    }
}

/// Sorted by name; looked up with binary search.
static COMMANDS: &[CommandDef] = &[
    CommandDef { name: "ADDLINE", min_params: 6, source: SourceKind::Any, handler: xlines::handle_addline, routing: broadcast },
    CommandDef { name: "AWAY", min_params: 0, source: SourceKind::User, handler: users::handle_away, routing: broadcast },
    CommandDef { name: "BURST", min_params: 0, source: SourceKind::Server, handler: servers::handle_burst, routing: local },
    CommandDef { name: "DELLINE", min_params: 2, source: SourceKind::Any, handler: xlines::handle_delline, routing: broadcast },
    CommandDef { name: "ENCAP", min_params: 2, source: SourceKind::Any, handler: servers::handle_encap, routing: local },
    CommandDef { name: "ENDBURST", min_params: 0, source: SourceKind::Server, handler: servers::handle_endburst, routing: broadcast },
    CommandDef { name: "FJOIN", min_params: 3, source: SourceKind::Server, handler: channels::handle_fjoin, routing: broadcast },
    CommandDef { name: "FMODE", min_params: 3, source: SourceKind::Any, handler: channels::handle_fmode, routing: broadcast },
    CommandDef { name: "FTOPIC", min_params: 5, source: SourceKind::Any, handler: channels::handle_ftopic, routing: broadcast },
    CommandDef { name: "IDLE", min_params: 1, source: SourceKind::User, handler: users::handle_idle, routing: unicast_first },
    CommandDef { name: "IJOIN", min_params: 1, source: SourceKind::User, handler: channels::handle_ijoin, routing: broadcast },
    CommandDef { name: "KICK", min_params: 2, source: SourceKind::Any, handler: channels::handle_kick, routing: broadcast },
    CommandDef { name: "KILL", min_params: 1, source: SourceKind::Any, handler: users::handle_kill, routing: broadcast },
    CommandDef { name: "LMODE", min_params: 6, source: SourceKind::Server, handler: channels::handle_lmode, routing: broadcast },
    CommandDef { name: "METADATA", min_params: 2, source: SourceKind::Server, handler: channels::handle_metadata, routing: broadcast },
    CommandDef { name: "MODE", min_params: 2, source: SourceKind::Any, handler: channels::handle_mode, routing: broadcast },
    CommandDef { name: "NICK", min_params: 2, source: SourceKind::User, handler: users::handle_nick, routing: broadcast },
    CommandDef { name: "NOTICE", min_params: 2, source: SourceKind::Any, handler: channels::handle_privmsg, routing: message_first },
    CommandDef { name: "NUM", min_params: 3, source: SourceKind::Server, handler: servers::handle_num, routing: num_routing },
    CommandDef { name: "OPERTYPE", min_params: 1, source: SourceKind::User, handler: users::handle_opertype, routing: broadcast },
    CommandDef { name: "PART", min_params: 1, source: SourceKind::User, handler: channels::handle_part, routing: broadcast },
    CommandDef { name: "PING", min_params: 1, source: SourceKind::Server, handler: servers::handle_ping, routing: ping_routing },
    CommandDef { name: "PONG", min_params: 1, source: SourceKind::Server, handler: servers::handle_pong, routing: ping_routing },
    CommandDef { name: "PRIVMSG", min_params: 2, source: SourceKind::Any, handler: channels::handle_privmsg, routing: message_first },
    CommandDef { name: "PUSH", min_params: 2, source: SourceKind::Any, handler: servers::handle_push, routing: unicast_first },
    CommandDef { name: "QUIT", min_params: 0, source: SourceKind::User, handler: users::handle_quit, routing: broadcast },
    CommandDef { name: "RCONNECT", min_params: 2, source: SourceKind::Any, handler: servers::handle_rconnect, routing: local },
    CommandDef { name: "RESYNC", min_params: 1, source: SourceKind::Server, handler: channels::handle_resync, routing: local },
    CommandDef { name: "RSQUIT", min_params: 1, source: SourceKind::Any, handler: servers::handle_rsquit, routing: local },
    CommandDef { name: "SAVE", min_params: 2, source: SourceKind::Server, handler: users::handle_save, routing: broadcast },
    CommandDef { name: "SERVER", min_params: 3, source: SourceKind::Server, handler: servers::handle_server, routing: broadcast },
    CommandDef { name: "SINFO", min_params: 2, source: SourceKind::Server, handler: servers::handle_sinfo, routing: broadcast },
    CommandDef { name: "SNONOTICE", min_params: 2, source: SourceKind::Any, handler: servers::handle_snonotice, routing: broadcast },
    CommandDef { name: "SQUIT", min_params: 2, source: SourceKind::Any, handler: servers::handle_squit, routing: local },
    CommandDef { name: "TOPIC", min_params: 2, source: SourceKind::User, handler: channels::handle_topic, routing: broadcast },
    CommandDef { name: "UID", min_params: 10, source: SourceKind::Server, handler: users::handle_uid, routing: broadcast },
];

fn ping_routing(_: &Source, params: &[String]) -> Routing {
    // Answered locally when addressed to us; otherwise routed on
    // toward the named server.
    match params.first() {
        Some(dest) => Routing::Unicast(dest.clone()),
        None => Routing::Local,
    }
}

fn num_routing(_: &Source, params: &[String]) -> Routing {
    match params.get(1) {
        Some(target) => Routing::Unicast(target.clone()),
        None => Routing::Local,
    }
}

pub fn find_command(verb: &str) -> Option<&'static CommandDef> {
    COMMANDS
        .binary_search_by(|def| def.name.cmp(verb))
        .ok()
        .map(|i| &COMMANDS[i])
}

/// Resolves a prefix to a source. `None` means the prefix refers to
/// something we no longer know about (raced with QUIT/SQUIT) and the
/// line should be dropped silently.
fn resolve_source(net: &Network, peer: ServerHandle, prefix: Option<&str>) -> Option<Source> {
    let Some(prefix) = prefix else {
        return Some(Source::Server(peer));
    };
    if let Ok(sid) = prefix.parse::<Sid>() {
        return net.tree.find_by_sid(sid).map(Source::Server);
    }
    if let Ok(uid) = prefix.parse::<Uid>() {
        return net.users.find_by_uuid(&uid).map(|u| Source::User(u.uid.clone()));
    }
    // Name-prefixed lines come from legacy peers.
    net.tree.find_by_name(prefix).map(Source::Server)
}

/// Dispatches one decoded line from a CONNECTED link.
pub fn dispatch(
    state: &Arc<SharedState>,
    link: LinkId,
    mut msg: Message,
) -> Result<(), ProtocolViolation> {
    let mut guard = state.net.lock();
    let net = &mut *guard;
    let Some(peer) = net.tree.find_by_link(link) else {
        // The link lost its server mid-line; nothing to attribute the
        // command to.
        return Ok(());
    };

    let Some(source) = resolve_source(net, peer, msg.source.as_deref()) else {
        tracing::debug!(command = %msg.command, source = ?msg.source, "dropping line from unknown source");
        return Ok(());
    };

    let Some(def) = find_command(&msg.command) else {
        tracing::debug!(command = %msg.command, "unknown server command, dropped");
        return Ok(());
    };

    if msg.params.len() < def.min_params {
        return Err(ProtocolViolation::new(format!(
            "Insufficient parameters for {}",
            msg.command
        )));
    }
    match (def.source, &source) {
        (SourceKind::User, Source::Server(_)) | (SourceKind::Server, Source::User(_)) => {
            return Err(ProtocolViolation::new(format!(
                "Invalid source for {}",
                msg.command
            )));
        }
        _ => {}
    }

    // Anti-spoofing: the claimed source must actually live behind the
    // socket that delivered the line.
    let claimed = source.server(net);
    if claimed.is_none_or(|server| !router::direction_ok(net, server, link)) {
        tracing::warn!(
            command = %msg.command,
            source = ?msg.source,
            link,
            "dropping line with spoofed direction"
        );
        return Ok(());
    }

    let prefix = source.prefix(net);
    let result = {
        let mut ctx = Ctx {
            state,
            net: &mut *net,
            link,
            peer,
        };
        (def.handler)(&mut ctx, &source, &mut msg)?
    };

    if result == CmdResult::Success {
        let routing = (def.routing)(&source, &msg.params);
        router::route(state, net, Some(link), &prefix, &msg.command, &msg.params, &routing);
    }
    net.tree.flush_culls();
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table_is_sorted_for_binary_search() {
        for pair in COMMANDS.windows(2) {
            assert!(
                pair[0].name < pair[1].name,
                "{} must sort before {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn lookup_hits_every_entry() {
        for def in COMMANDS {
            assert_eq!(find_command(def.name).unwrap().name, def.name);
        }
        assert!(find_command("NOSUCH").is_none());
    }
}
