//! User-lifecycle commands: introduction, nick changes, quits, kills,
//! SAVE-based collision resolution, oper and away state.

use std::collections::HashMap;

use arbor_proto::{CmdBuilder, Message, Uid};

use crate::collide::{self, CollideOutcome};
use crate::error::{CmdResult, ProtocolViolation, extract_ts};
use crate::router;
use crate::state::user::{OperInfo, User};
use crate::util::now_secs;

use super::{Ctx, Source};

/// `UID <uuid> <ts> <nick> <host> <dhost> <ident> <ip> <signon>
/// +<modes> :<realname>` — a server introduces one of its users.
pub fn handle_uid(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::Server(server) = source else {
        unreachable!("dispatcher enforces a server source");
    };
    let params = &msg.params;
    let uid: Uid = params[0]
        .parse()
        .map_err(|_| ProtocolViolation::new(format!("Invalid UUID {}", params[0])))?;
    let ts = extract_ts(&params[1])?;
    let source_sid = ctx
        .net
        .tree
        .get(*server)
        .map(|n| n.sid)
        .ok_or_else(|| ProtocolViolation::new("Source server is gone"))?;
    if uid.sid() != source_sid {
        return Err(ProtocolViolation::new(format!(
            "UID {uid} does not belong to {source_sid}"
        )));
    }
    if ctx.net.users.find_by_uuid(&uid).is_some() {
        return Err(ProtocolViolation::new(format!("Duplicate UUID {uid}")));
    }

    let mut nick = params[2].clone();
    let ident = params[5].clone();
    let ip = params[6].clone();

    let clash = ctx
        .net
        .users
        .find_by_nick(&nick)
        .map(|u| (u.uid.clone(), u.nick_ts, u.ident.clone(), u.ip.clone()));
    if let Some((existing_uid, existing_ts, existing_ident, existing_ip)) = clash {
        match collide::resolve(existing_ts, &existing_ident, &existing_ip, ts, &ident, &ip) {
            CollideOutcome::RemoteLoses => {
                // They get a SAVE; the introduction lands under UUID.
                save_back(ctx, &uid, ts);
                nick = uid.to_string();
            }
            CollideOutcome::LocalLoses => {
                save_user(ctx, &existing_uid);
            }
            CollideOutcome::BothLose => {
                save_back(ctx, &uid, ts);
                save_user(ctx, &existing_uid);
                nick = uid.to_string();
            }
        }
    }

    let signon = extract_ts(&msg.params[7])?;
    let modes = msg.params[8].trim_start_matches('+').to_string();
    // Mode parameters may sit between the mode letters and the
    // realname, which is always last.
    let realname = msg.params.last().cloned().unwrap_or_default();
    let user = User {
        uid: uid.clone(),
        nick: nick.clone(),
        nick_ts: ts,
        ident,
        host: msg.params[3].clone(),
        dhost: msg.params[4].clone(),
        ip,
        signon,
        modes,
        realname,
        oper: None,
        away: None,
        metadata: HashMap::new(),
    };
    ctx.net.users.insert(user);
    if let Some(node) = ctx.net.tree.get_mut(*server) {
        node.user_count += 1;
    }
    if !ctx.quiet(*server) {
        tracing::debug!(uid = %uid, nick = %nick, server = %source_sid, "user introduced");
    }
    Ok(CmdResult::Success)
}

/// `NICK <newnick> <ts>` — a remote user changes nick, possibly
/// colliding with someone we already know.
pub fn handle_nick(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let new_nick = msg.params[0].clone();
    let ts = extract_ts(&msg.params[1])?;

    let (changer_ident, changer_ip) = {
        let user = ctx
            .net
            .users
            .find_by_uuid(uid)
            .ok_or_else(|| ProtocolViolation::new("NICK from unknown user"))?;
        (user.ident.clone(), user.ip.clone())
    };

    let clash = ctx
        .net
        .users
        .find_by_nick(&new_nick)
        .filter(|u| u.uid != *uid)
        .map(|u| (u.uid.clone(), u.nick_ts, u.ident.clone(), u.ip.clone()));
    if let Some((existing_uid, existing_ts, existing_ident, existing_ip)) = clash {
        match collide::resolve(
            existing_ts,
            &existing_ident,
            &existing_ip,
            ts,
            &changer_ident,
            &changer_ip,
        ) {
            CollideOutcome::RemoteLoses => {
                // Halt the change here; the origin gets a SAVE.
                save_back(ctx, uid, ts);
                ctx.net.users.rename(uid, uid.as_str(), ts);
                return Ok(CmdResult::Failure);
            }
            CollideOutcome::LocalLoses => {
                save_user(ctx, &existing_uid);
            }
            CollideOutcome::BothLose => {
                save_back(ctx, uid, ts);
                save_user(ctx, &existing_uid);
                ctx.net.users.rename(uid, uid.as_str(), ts);
                return Ok(CmdResult::Failure);
            }
        }
    }
    ctx.net.users.rename(uid, &new_nick, ts);
    Ok(CmdResult::Success)
}

/// Issues `SAVE` back along the link a collision came in on.
fn save_back(ctx: &mut Ctx, uid: &Uid, ts: u64) {
    let line = CmdBuilder::new(ctx.our_sid(), "SAVE")
        .push(uid.to_string())
        .push_int(ts)
        .finalize();
    ctx.state.send_to_link(ctx.link, line);
}

/// Forces one of our known users onto their UUID and tells the whole
/// network with a broadcast `SAVE`.
fn save_user(ctx: &mut Ctx, uid: &Uid) {
    let Some(ts) = ctx.net.users.find_by_uuid(uid).map(|u| u.nick_ts) else {
        return;
    };
    let line = CmdBuilder::new(ctx.our_sid(), "SAVE")
        .push(uid.to_string())
        .push_int(ts)
        .finalize();
    router::broadcast(ctx.state, ctx.net, None, &line);
    ctx.net.users.rename(uid, uid.as_str(), ts);
}

/// `SAVE <uuid> <ts>` — force a user onto their UUID, idempotently:
/// it applies only while the user's TS still matches.
pub fn handle_save(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Ok(uid) = msg.params[0].parse::<Uid>() else {
        return Ok(CmdResult::Failure);
    };
    let ts = extract_ts(&msg.params[1])?;
    let Some(user) = ctx.net.users.find_by_uuid(&uid) else {
        return Ok(CmdResult::Failure);
    };
    if user.nick_ts != ts {
        return Ok(CmdResult::Failure);
    }
    ctx.net.users.rename(&uid, uid.as_str(), ts);
    Ok(CmdResult::Success)
}

/// `QUIT [:reason]`
pub fn handle_quit(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let reason = msg.params.first().cloned().unwrap_or_default();
    match ctx.net.quit_user(uid) {
        Some(user) => {
            tracing::debug!(uid = %uid, nick = %user.nick, reason = %reason, "user quit");
            Ok(CmdResult::Success)
        }
        None => Ok(CmdResult::Failure),
    }
}

/// `KILL <target> [:reason]`
pub fn handle_kill(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Some(target) = ctx.net.users.find(&msg.params[0]).map(|u| u.uid.clone()) else {
        // Raced with a quit; nothing left to kill.
        return Ok(CmdResult::Failure);
    };
    // Translate a nick argument so downstream peers can resolve it
    // after the user is gone.
    msg.params[0] = target.to_string();
    ctx.net.quit_user(&target);
    Ok(CmdResult::Success)
}

/// `OPERTYPE :<type>` with the grant set carried in `~` tags; a bare
/// OPERTYPE comes from a legacy peer and means every privilege.
pub fn handle_opertype(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let server = source.server(ctx.net);
    let opertype = msg.params[0].clone();
    let Some(user) = ctx.net.users.find_by_uuid_mut(uid) else {
        return Ok(CmdResult::Failure);
    };
    let newly_opered = user.oper.is_none();
    user.oper = Some(OperInfo {
        name: opertype.clone(),
        chanmodes: msg.tags.get("~chanmodes").cloned(),
        usermodes: msg.tags.get("~usermodes").cloned(),
        snomasks: msg.tags.get("~snomasks").cloned(),
        commands: msg.tags.get("~commands").cloned(),
        privileges: msg.tags.get("~privileges").cloned(),
    });
    if let Some(name) = msg.tags.get("~name") {
        if let Some(oper) = user.oper.as_mut() {
            oper.name = name.clone();
        }
    }
    if newly_opered {
        if let Some(node) = server.and_then(|s| ctx.net.tree.get_mut(s)) {
            node.oper_count += 1;
        }
    }
    if let Some(server) = server {
        if !ctx.quiet(server) {
            tracing::info!(uid = %uid, opertype = %opertype, "remote oper");
        }
    }
    Ok(CmdResult::Success)
}

/// `AWAY [<ts>] [:<reason>]` — absent parameters mean back.
pub fn handle_away(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let Some(user) = ctx.net.users.find_by_uuid_mut(uid) else {
        return Ok(CmdResult::Failure);
    };
    user.away = match msg.params.len() {
        0 => None,
        1 => Some((now_secs(), msg.params[0].clone())),
        _ => Some((extract_ts(&msg.params[0])?, msg.params[1].clone())),
    };
    Ok(CmdResult::Success)
}

/// `IDLE <target>` asks for idle info; `IDLE <requester> <signon>
/// <idle>` answers. We answer for our own users; the client layer
/// owns real idle tracking, so the answer is signon plus zero idle.
pub fn handle_idle(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    if msg.params.len() >= 3 {
        // A response passing through (or arriving for a local user).
        return Ok(CmdResult::Success);
    }
    let Ok(target) = msg.params[0].parse::<Uid>() else {
        return Ok(CmdResult::Failure);
    };
    if target.sid() != ctx.net.sid() {
        // Not ours; let routing carry the request onward.
        return Ok(CmdResult::Success);
    }
    let Some(user) = ctx.net.users.find_by_uuid(&target) else {
        return Ok(CmdResult::Failure);
    };
    let line = CmdBuilder::new(target.to_string(), "IDLE")
        .push(source.prefix(ctx.net))
        .push_int(user.signon)
        .push_int(0u64)
        .finalize();
    ctx.state.send_to_link(ctx.link, line);
    Ok(CmdResult::Failure)
}

#[cfg(test)]
mod tests {
    use crate::commands::dispatch_test_support::{TestNet, msg};

    #[test]
    fn uid_introduces_a_remote_user() {
        let mut t = TestNet::new();
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +i :Bob",
        ))
        .unwrap();
        let net = t.state.net.lock();
        let bob = net.users.find_by_nick("bob").unwrap();
        assert_eq!(bob.uid.as_str(), "002AAAAAA");
        assert_eq!(bob.nick_ts, 1000);
    }

    #[test]
    fn uid_with_foreign_sid_kills_the_link() {
        let mut t = TestNet::new();
        let err = t
            .dispatch(msg(
                ":002 UID 009AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +i :Bob",
            ))
            .unwrap_err();
        assert!(err.0.contains("does not belong"));
    }

    #[test]
    fn nick_collision_newer_different_identity_loses() {
        // Our foo has ts=1000; B introduces foo with ts=1500 and a
        // different ident/ip. The incoming user is renamed to UUID,
        // B receives a SAVE, and our foo is untouched.
        let mut t = TestNet::new();
        t.add_local("foo", "a", "10.0.0.1", 1000);
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1500 foo h2 h2 b 10.0.0.2 1500 + :B",
        ))
        .unwrap();
        let sent = t.sent();
        assert!(
            sent.iter().any(|l| l == ":001 SAVE 002AAAAAA 1500"),
            "expected a SAVE toward the loser, got {sent:?}"
        );
        let net = t.state.net.lock();
        assert_eq!(net.users.find_by_nick("foo").unwrap().uid.as_str(), "001AAAAAA");
        assert_eq!(
            net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
            "002AAAAAA"
        );
    }

    #[test]
    fn nick_collision_same_identity_newer_local_wins() {
        // Same ident@ip is a client racing its own reconnect: the
        // older session loses. Ours is newer, so the remote gets the
        // SAVE.
        let mut t = TestNet::new();
        let local = t.add_local("foo", "a", "10.0.0.1", 1500);
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 foo a a 10.0.0.1 1000 + :B",
        ))
        .unwrap();
        let sent = t.sent();
        assert!(
            sent.iter().any(|l| l == ":001 SAVE 002AAAAAA 1000"),
            "expected a SAVE toward the older remote, got {sent:?}"
        );
        let net = t.state.net.lock();
        assert_eq!(net.users.find_by_nick("foo").unwrap().uid, local);
        assert_eq!(
            net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
            "002AAAAAA"
        );
    }

    #[test]
    fn nick_collision_equal_ts_forces_both() {
        let mut t = TestNet::new();
        t.add_local("foo", "a", "10.0.0.1", 1000);
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 foo h2 h2 b 10.0.0.2 1000 + :B",
        ))
        .unwrap();
        let net = t.state.net.lock();
        assert_eq!(
            net.users.find_by_uuid(&"001AAAAAA".parse().unwrap()).unwrap().nick,
            "001AAAAAA"
        );
        assert_eq!(
            net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
            "002AAAAAA"
        );
        assert!(net.users.find_by_nick("foo").is_none());
    }

    #[test]
    fn save_is_idempotent() {
        let mut t = TestNet::new();
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +i :Bob",
        ))
        .unwrap();
        t.dispatch(msg(":002 SAVE 002AAAAAA 1000")).unwrap();
        {
            let net = t.state.net.lock();
            assert_eq!(
                net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
                "002AAAAAA"
            );
        }
        // Applying it again changes nothing and raises nothing.
        t.dispatch(msg(":002 SAVE 002AAAAAA 1000")).unwrap();
        let net = t.state.net.lock();
        assert_eq!(
            net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
            "002AAAAAA"
        );
    }

    #[test]
    fn save_with_stale_ts_is_ignored() {
        let mut t = TestNet::new();
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +i :Bob",
        ))
        .unwrap();
        t.dispatch(msg(":002 SAVE 002AAAAAA 999")).unwrap();
        let net = t.state.net.lock();
        assert_eq!(
            net.users.find_by_uuid(&"002AAAAAA".parse().unwrap()).unwrap().nick,
            "bob"
        );
    }

    #[test]
    fn quit_removes_user_and_memberships() {
        let mut t = TestNet::new();
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +i :Bob",
        ))
        .unwrap();
        t.dispatch(msg(":002 FJOIN #x 900 + :,002AAAAAA")).unwrap();
        t.dispatch(msg(":002AAAAAA QUIT :gone")).unwrap();
        let net = t.state.net.lock();
        assert!(net.users.find_by_nick("bob").is_none());
        assert!(net.chans.find("#x").is_none());
    }

    #[test]
    fn opertype_records_the_grant_tags() {
        let mut t = TestNet::new();
        t.dispatch(msg(
            ":002 UID 002AAAAAA 1000 bob host.b host.b bi 10.0.0.2 1000 +o :Bob",
        ))
        .unwrap();
        t.dispatch(msg(
            "@~name=NetAdmin;~snomasks=* :002AAAAAA OPERTYPE :NetAdmin",
        ))
        .unwrap();
        let net = t.state.net.lock();
        let bob = net.users.find_by_nick("bob").unwrap();
        let oper = bob.oper.as_ref().unwrap();
        assert_eq!(oper.name, "NetAdmin");
        assert_eq!(oper.snomasks.as_deref(), Some("*"));
        // Absent tags mean a legacy peer: all privileges.
        assert!(oper.privileges.is_none());
    }
}
