//! Channel commands: the FJOIN timestamp merge, incremental joins,
//! parts and kicks, TS-guarded mode changes, topics, list modes and
//! extensible metadata.

use arbor_proto::{CmdBuilder, Message, Uid};

use crate::burst;
use crate::error::{CmdResult, ProtocolViolation, extract_ts};
use crate::router;
use crate::state::channel::{ListModeEntry, ModeStack, Topic, parse_mode_changes};
use crate::util::now_secs;

use super::{Ctx, Source};

/// `FJOIN <chan> <ts> +<modes> [<params>…] :<prefixes>,<uuid> …`
///
/// The side with the lower timestamp wins. Losing locally strips
/// every mode and prefix (announced once, as a single FMODE batch);
/// losing remotely means their modes are ignored and their members
/// join bare. Equal timestamps merge.
pub fn handle_fjoin(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let chan_name = msg.params[0].clone();
    let their_ts = extract_ts(&msg.params[1])?;
    let member_list = if msg.params.len() > 3 {
        msg.params.last().cloned().unwrap_or_default()
    } else {
        String::new()
    };
    let mode_str = msg.params.get(2).cloned().unwrap_or_default();
    let mode_params: Vec<String> = if msg.params.len() > 4 {
        msg.params[3..msg.params.len() - 1].to_vec()
    } else {
        Vec::new()
    };

    let existing_ts = ctx.net.chans.find(&chan_name).map(|c| c.ts);
    let mut apply_their_modes = true;
    match existing_ts {
        None => {
            ctx.net.chans.find_or_create(&chan_name, their_ts);
        }
        Some(our_ts) if their_ts < our_ts => {
            // We lose: drop to their TS, strip everything we had, then
            // take their modes. One FMODE announces the strip.
            tracing::debug!(chan = %chan_name, our_ts, their_ts, "channel merge, lowering TS");
            let mut stack = ModeStack::default();
            let chan = ctx.net.chans.find_mut(&chan_name).expect("channel exists");
            chan.ts = their_ts;
            chan.strip_all_modes(&mut stack);
            if ctx.state.config.network.options.announcets {
                let notice = CmdBuilder::new(ctx.our_sid(), "NOTICE")
                    .push(&chan_name)
                    .push_last(format!(
                        "TS for {chan_name} changed from {our_ts} to {their_ts}"
                    ))
                    .finalize();
                router::broadcast(ctx.state, ctx.net, Some(ctx.link), &notice);
            }
            announce_mode_stack(ctx, &chan_name, their_ts, stack);
        }
        Some(our_ts) if their_ts > our_ts => {
            // They lose: their modes are noise, their members join
            // with no status.
            tracing::debug!(chan = %chan_name, our_ts, their_ts, "channel merge, keeping our TS");
            apply_their_modes = false;
        }
        Some(_) => {} // equal: merge below
    }

    if apply_their_modes {
        let merged_ts = ctx.net.chans.find(&chan_name).map(|c| c.ts).unwrap_or(their_ts);
        let changes = parse_mode_changes(&mode_str, &mode_params);
        if let Some(chan) = ctx.net.chans.find_mut(&chan_name) {
            for (adding, letter, param) in changes {
                chan.apply_mode(adding, letter, param.as_deref(), merged_ts);
            }
        }
    }

    for item in member_list.split_whitespace() {
        let Some((prefixes, uuid)) = item.split_once(',') else {
            continue;
        };
        let Ok(uid) = uuid.parse::<Uid>() else {
            continue;
        };
        // Direction check per member: the user must live behind the
        // socket this FJOIN arrived on, or it raced with a split.
        let Some(user_server) = ctx.net.tree.find_by_sid(uid.sid()) else {
            tracing::debug!(chan = %chan_name, uuid, "ignoring member from unknown server (probably quit)");
            continue;
        };
        if !router::direction_ok(ctx.net, user_server, ctx.link) {
            continue;
        }
        if ctx.net.users.find_by_uuid(&uid).is_none() {
            tracing::debug!(chan = %chan_name, uuid, "ignoring nonexistent member (probably quit)");
            continue;
        }
        if let Some(chan) = ctx.net.chans.find_mut(&chan_name) {
            chan.join(uid, if apply_their_modes { prefixes } else { "" });
        }
    }
    Ok(CmdResult::Success)
}

/// Emits the stacked mode removals as FMODE lines to every peer (and
/// nowhere else; the winning side already knows).
fn announce_mode_stack(ctx: &mut Ctx, chan: &str, ts: u64, stack: ModeStack) {
    if stack.is_empty() {
        return;
    }
    let sid = ctx.our_sid();
    for param_vec in stack.finalize() {
        let mut builder = CmdBuilder::new(&sid, "FMODE").push(chan).push_int(ts);
        for p in param_vec {
            builder = builder.push(p);
        }
        let line = builder.finalize();
        router::broadcast(ctx.state, ctx.net, Some(ctx.link), &line);
    }
}

/// `IJOIN <chan> [<ts> [<prefixes>]]` — one user joins a channel that
/// already exists network-wide. A missing channel here is a desync;
/// we recreate it and ask the origin to RESYNC.
pub fn handle_ijoin(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let chan_name = msg.params[0].clone();
    let prefixes = msg.params.get(2).cloned().unwrap_or_default();

    if ctx.net.chans.find(&chan_name).is_none() {
        let ts = match msg.params.get(1) {
            Some(t) => extract_ts(t)?,
            None => now_secs(),
        };
        tracing::debug!(chan = %chan_name, "IJOIN for unknown channel, requesting resync");
        ctx.net.chans.find_or_create(&chan_name, ts);
        let line = CmdBuilder::new(ctx.our_sid(), "RESYNC").push(&chan_name).finalize();
        ctx.state.send_to_link(ctx.link, line);
    }
    if let Some(chan) = ctx.net.chans.find_mut(&chan_name) {
        chan.join(uid.clone(), &prefixes);
    }
    Ok(CmdResult::Success)
}

/// `RESYNC <chan>` — a peer thinks its view of the channel is stale;
/// answer with our full FJOIN straight down the asking link.
pub fn handle_resync(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let sid = ctx.our_sid();
    if let Some(chan) = ctx.net.chans.find(&msg.params[0]) {
        for line in burst::fjoin_lines(&sid, chan) {
            ctx.state.send_to_link(ctx.link, line);
        }
    }
    Ok(CmdResult::Failure)
}

/// `PART <chan> [:reason]`
pub fn handle_part(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let Source::User(uid) = source else {
        unreachable!("dispatcher enforces a user source");
    };
    let chan_name = msg.params[0].clone();
    let Some(chan) = ctx.net.chans.find_mut(&chan_name) else {
        return Ok(CmdResult::Failure);
    };
    if !chan.part(uid) {
        return Ok(CmdResult::Failure);
    }
    if chan.members.is_empty() {
        ctx.net.chans.remove(&chan_name);
    }
    Ok(CmdResult::Success)
}

/// `KICK <chan> <target> [:reason]`
pub fn handle_kick(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let chan_name = msg.params[0].clone();
    let Some(target) = ctx.net.users.find(&msg.params[1]).map(|u| u.uid.clone()) else {
        return Ok(CmdResult::Failure);
    };
    msg.params[1] = target.to_string();
    let Some(chan) = ctx.net.chans.find_mut(&chan_name) else {
        return Ok(CmdResult::Failure);
    };
    if !chan.part(&target) {
        // Already gone; the kick crossed a part on the wire.
        return Ok(CmdResult::Failure);
    }
    if chan.members.is_empty() {
        ctx.net.chans.remove(&chan_name);
    }
    Ok(CmdResult::Success)
}

/// `FMODE <target> <ts> <modes> [<params>…]` — a TS-guarded mode
/// change. A timestamp newer than the channel's means the sender lost
/// a merge it hasn't seen yet; the change is stale and dropped.
pub fn handle_fmode(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target = msg.params[0].clone();
    let ts = extract_ts(&msg.params[1])?;
    let mode_str = msg.params[2].clone();
    let mode_params = msg.params[3..].to_vec();

    if target.starts_with('#') {
        let Some(chan) = ctx.net.chans.find_mut(&target) else {
            return Ok(CmdResult::Failure);
        };
        if ts > chan.ts {
            tracing::debug!(chan = %target, ts, chan_ts = chan.ts, "dropping FMODE with stale TS");
            return Ok(CmdResult::Failure);
        }
        let chan_ts = chan.ts;
        for (adding, letter, param) in parse_mode_changes(&mode_str, &mode_params) {
            chan.apply_mode(adding, letter, param.as_deref(), chan_ts);
        }
        return Ok(CmdResult::Success);
    }
    apply_user_modes(ctx, &target, &mode_str)
}

/// `MODE <target> <modes>` — unguarded user-mode change.
pub fn handle_mode(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target = msg.params[0].clone();
    let mode_str = msg.params[1].clone();
    apply_user_modes(ctx, &target, &mode_str)
}

fn apply_user_modes(ctx: &mut Ctx, target: &str, mode_str: &str) -> Result<CmdResult, ProtocolViolation> {
    let Some(uid) = ctx.net.users.find(target).map(|u| u.uid.clone()) else {
        return Ok(CmdResult::Failure);
    };
    let Some(user) = ctx.net.users.find_by_uuid_mut(&uid) else {
        return Ok(CmdResult::Failure);
    };
    let mut adding = true;
    let mut modes: Vec<char> = user.modes.chars().collect();
    for c in mode_str.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            letter => {
                if adding {
                    if !modes.contains(&letter) {
                        modes.push(letter);
                    }
                } else {
                    modes.retain(|&m| m != letter);
                }
            }
        }
    }
    modes.sort_unstable();
    user.modes = modes.into_iter().collect();
    Ok(CmdResult::Success)
}

/// `LMODE <chan> <ts> <letter> <mask> <setter> <set-ts> …` — list-mode
/// entries, bursted or incrementally replicated.
pub fn handle_lmode(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let ts = extract_ts(&msg.params[1])?;
    let letter = msg.params[2]
        .chars()
        .next()
        .ok_or_else(|| ProtocolViolation::new("Empty mode letter in LMODE"))?;
    let Some(chan) = ctx.net.chans.find_mut(&msg.params[0]) else {
        return Ok(CmdResult::Failure);
    };
    if ts > chan.ts {
        return Ok(CmdResult::Failure);
    }
    for triple in msg.params[3..].chunks(3) {
        let [mask, setter, set_ts] = triple else {
            return Err(ProtocolViolation::new("Truncated LMODE entry"));
        };
        chan.add_list_entry(
            letter,
            ListModeEntry {
                mask: mask.clone(),
                setter: setter.clone(),
                set_ts: extract_ts(set_ts)?,
            },
        );
    }
    Ok(CmdResult::Success)
}

/// `FTOPIC <chan> <chan-ts> <topic-ts> <setter> :<text>` — topic
/// replication. An older topic timestamp never overwrites a newer
/// one, and an empty topic with a newer timestamp clears.
pub fn handle_ftopic(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let chan_ts = extract_ts(&msg.params[1])?;
    let topic_ts = extract_ts(&msg.params[2])?;
    let Some(chan) = ctx.net.chans.find_mut(&msg.params[0]) else {
        return Ok(CmdResult::Failure);
    };
    if chan_ts > chan.ts {
        // Their channel is younger; their topic lost with it.
        return Ok(CmdResult::Failure);
    }
    if chan.topic_set != 0 && topic_ts <= chan.topic_set {
        return Ok(CmdResult::Failure);
    }
    chan.topic = Some(Topic {
        text: msg.params[4].clone(),
        set_by: msg.params[3].clone(),
        set_ts: topic_ts,
    });
    chan.topic_set = topic_ts;
    Ok(CmdResult::Success)
}

/// `TOPIC <chan> :<text>` — a user set a topic; stamp it now.
pub fn handle_topic(
    ctx: &mut Ctx,
    source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let setter = source
        .user(ctx.net)
        .map(|u| u.nick.clone())
        .unwrap_or_else(|| source.prefix(ctx.net));
    let Some(chan) = ctx.net.chans.find_mut(&msg.params[0]) else {
        return Ok(CmdResult::Failure);
    };
    let ts = now_secs();
    chan.topic = Some(Topic {
        text: msg.params[1].clone(),
        set_by: setter,
        set_ts: ts,
    });
    chan.topic_set = ts;
    Ok(CmdResult::Success)
}

/// `PRIVMSG`/`NOTICE <target> :<text>` — relayed messages. Local
/// delivery belongs to the client layer; the S2S core only vets that
/// the target still exists and lets the router fan it out to the
/// servers that hold it.
pub fn handle_privmsg(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target = msg.params[0].trim_start_matches(['@', '%', '+']);
    if target.starts_with('$') {
        return Ok(CmdResult::Success);
    }
    if target.starts_with('#') {
        if ctx.net.chans.find(target).is_none() {
            return Ok(CmdResult::Failure);
        }
        return Ok(CmdResult::Success);
    }
    if ctx.net.users.find(target).is_none() {
        return Ok(CmdResult::Failure);
    }
    Ok(CmdResult::Success)
}

/// `METADATA <target> [<uuid>] <key> :<value>` — extensible typed
/// key-value slots on users, channels, memberships or the network
/// (`*`).
pub fn handle_metadata(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let target = msg.params[0].clone();
    if target.starts_with('#') && msg.params.len() >= 4 {
        if let Ok(member) = msg.params[1].parse::<Uid>() {
            // Membership slot.
            let key = msg.params[2].clone();
            let value = msg.params[3].clone();
            let Some(chan) = ctx.net.chans.find_mut(&target) else {
                return Ok(CmdResult::Failure);
            };
            let Some(memb) = chan.members.get_mut(&member) else {
                return Ok(CmdResult::Failure);
            };
            memb.metadata.insert(key, value);
            return Ok(CmdResult::Success);
        }
    }
    if msg.params.len() < 3 {
        // `METADATA <target> <key>` with no value clears nothing we
        // track; drop it.
        return Ok(CmdResult::Failure);
    }
    let key = msg.params[1].clone();
    let value = msg.params[2].clone();
    if target == "*" {
        tracing::debug!(key = %key, "network metadata updated");
        return Ok(CmdResult::Success);
    }
    if target.starts_with('#') {
        let Some(chan) = ctx.net.chans.find_mut(&target) else {
            return Ok(CmdResult::Failure);
        };
        chan.metadata.insert(key, value);
        return Ok(CmdResult::Success);
    }
    if let Ok(uid) = target.parse::<Uid>() {
        let Some(user) = ctx.net.users.find_by_uuid_mut(&uid) else {
            return Ok(CmdResult::Failure);
        };
        user.metadata.insert(key, value);
        return Ok(CmdResult::Success);
    }
    Ok(CmdResult::Failure)
}

#[cfg(test)]
mod tests {
    use crate::commands::dispatch_test_support::{TestNet, msg};
    use crate::state::channel::prefix_rank;

    fn introduce(t: &mut TestNet, uid: &str, nick: &str, ts: u64) {
        t.dispatch(msg(&format!(
            ":002 UID {uid} {ts} {nick} h h i 10.0.0.2 {ts} + :{nick}"
        )))
        .unwrap();
    }

    #[test]
    fn fjoin_ours_younger_strips_and_takes_theirs() {
        // Local #x at ts=2000 with +nt and alice opped. Inbound FJOIN
        // at ts=1500 with +im and bob opped: our TS drops, our modes
        // and alice's op go, +im and bob's op apply, and exactly one
        // FMODE announces the strip.
        let mut t = TestNet::new();
        let alice = t.add_local("alice", "a", "10.0.0.1", 900);
        {
            let mut net = t.state.net.lock();
            let chan = net.chans.find_or_create("#x", 2000);
            chan.simple_modes.insert('n');
            chan.simple_modes.insert('t');
            chan.join(alice.clone(), "o");
        }
        introduce(&mut t, "002AAAAAB", "bob", 1000);
        t.sent();
        t.dispatch(msg(":002 FJOIN #x 1500 +im :o,002AAAAAB")).unwrap();

        let fmodes: Vec<String> = t
            .sent()
            .into_iter()
            .filter(|l| l.contains("FMODE"))
            .collect();
        // The strip is announced toward peers other than the origin;
        // the origin link gets nothing.
        assert!(fmodes.is_empty(), "origin edge must not see the strip: {fmodes:?}");

        let net = t.state.net.lock();
        let chan = net.chans.find("#x").unwrap();
        assert_eq!(chan.ts, 1500);
        assert!(chan.simple_modes.contains(&'i'));
        assert!(chan.simple_modes.contains(&'m'));
        assert!(!chan.simple_modes.contains(&'n'));
        assert_eq!(chan.members[&alice].prefixes, "");
        assert_eq!(chan.members[&"002AAAAAB".parse().unwrap()].prefixes, "o");
    }

    #[test]
    fn fjoin_strip_announces_once_to_other_peers() {
        let mut t = TestNet::new();
        let (_, mut c_rx) = t.add_peer_c();
        let alice = t.add_local("alice", "a", "10.0.0.1", 900);
        {
            let mut net = t.state.net.lock();
            let chan = net.chans.find_or_create("#x", 2000);
            chan.simple_modes.insert('n');
            chan.simple_modes.insert('t');
            chan.join(alice, "o");
        }
        introduce(&mut t, "002AAAAAB", "bob", 1000);
        t.dispatch(msg(":002 FJOIN #x 1500 +im :o,002AAAAAB")).unwrap();

        let mut c_lines = Vec::new();
        while let Ok(line) = c_rx.try_recv() {
            c_lines.push(line.trim_end().to_string());
        }
        let fmodes: Vec<&String> = c_lines.iter().filter(|l| l.contains("FMODE")).collect();
        assert_eq!(fmodes.len(), 1, "exactly one FMODE: {c_lines:?}");
        assert!(fmodes[0].starts_with(":001 FMODE #x 1500 -"));
    }

    #[test]
    fn fjoin_theirs_younger_keeps_ours_and_adds_bare_members() {
        let mut t = TestNet::new();
        let alice = t.add_local("alice", "a", "10.0.0.1", 900);
        {
            let mut net = t.state.net.lock();
            let chan = net.chans.find_or_create("#x", 1000);
            chan.simple_modes.insert('t');
            chan.join(alice.clone(), "o");
        }
        introduce(&mut t, "002AAAAAB", "bob", 1000);
        t.dispatch(msg(":002 FJOIN #x 5000 +im :o,002AAAAAB")).unwrap();

        let net = t.state.net.lock();
        let chan = net.chans.find("#x").unwrap();
        assert_eq!(chan.ts, 1000);
        assert!(chan.simple_modes.contains(&'t'));
        assert!(!chan.simple_modes.contains(&'i'));
        assert_eq!(chan.members[&alice].prefixes, "o");
        assert_eq!(chan.members[&"002AAAAAB".parse().unwrap()].prefixes, "");
    }

    #[test]
    fn fjoin_equal_ts_merges_unions() {
        let mut t = TestNet::new();
        let alice = t.add_local("alice", "a", "10.0.0.1", 900);
        {
            let mut net = t.state.net.lock();
            let chan = net.chans.find_or_create("#x", 1000);
            chan.simple_modes.insert('n');
            chan.limit = Some(20);
            chan.join(alice.clone(), "o");
        }
        introduce(&mut t, "002AAAAAB", "bob", 1000);
        t.dispatch(msg(":002 FJOIN #x 1000 +tl 50 :v,002AAAAAB")).unwrap();

        let net = t.state.net.lock();
        let chan = net.chans.find("#x").unwrap();
        assert_eq!(chan.ts, 1000);
        assert!(chan.simple_modes.contains(&'n'));
        assert!(chan.simple_modes.contains(&'t'));
        // Higher limit wins the merge.
        assert_eq!(chan.limit, Some(50));
        assert_eq!(chan.members[&alice].prefixes, "o");
        assert_eq!(chan.members[&"002AAAAAB".parse().unwrap()].prefixes, "v");
        assert!(chan.members[&"002AAAAAB".parse().unwrap()].rank() == prefix_rank('v'));
    }

    /// Two FJOINs with the same TS applied in either order produce the
    /// same channel state.
    #[test]
    fn fjoin_equal_ts_is_order_independent() {
        let run = |first: &str, second: &str| {
            let mut t = TestNet::new();
            introduce(&mut t, "002AAAAAA", "u1", 500);
            introduce(&mut t, "002AAAAAB", "u2", 500);
            t.dispatch(msg(first)).unwrap();
            t.dispatch(msg(second)).unwrap();
            let net = t.state.net.lock();
            let chan = net.chans.find("#d").unwrap();
            (
                chan.ts,
                chan.simple_modes.clone(),
                chan.limit,
                chan.key.clone(),
                chan.members[&"002AAAAAA".parse().unwrap()].prefixes.clone(),
                chan.members[&"002AAAAAB".parse().unwrap()].prefixes.clone(),
            )
        };
        let a = ":002 FJOIN #d 1000 +ntl 10 :o,002AAAAAA";
        let b = ":002 FJOIN #d 1000 +mk sekrit :v,002AAAAAB";
        assert_eq!(run(a, b), run(b, a));
    }

    #[test]
    fn fmode_with_stale_ts_is_dropped() {
        let mut t = TestNet::new();
        t.dispatch(msg(":002 FJOIN #x 1000 +n :")).unwrap();
        t.dispatch(msg(":002 FMODE #x 2000 +i")).unwrap();
        {
            let net = t.state.net.lock();
            assert!(!net.chans.find("#x").unwrap().simple_modes.contains(&'i'));
        }
        t.dispatch(msg(":002 FMODE #x 1000 +i")).unwrap();
        let net = t.state.net.lock();
        assert!(net.chans.find("#x").unwrap().simple_modes.contains(&'i'));
    }

    #[test]
    fn ftopic_keeps_the_newest_topic() {
        let mut t = TestNet::new();
        t.dispatch(msg(":002 FJOIN #x 1000 + :")).unwrap();
        t.dispatch(msg(":002 FTOPIC #x 1000 1500 alice :first")).unwrap();
        t.dispatch(msg(":002 FTOPIC #x 1000 1400 bob :older")).unwrap();
        {
            let net = t.state.net.lock();
            assert_eq!(net.chans.find("#x").unwrap().topic.as_ref().unwrap().text, "first");
        }
        t.dispatch(msg(":002 FTOPIC #x 1000 1600 eve :newest")).unwrap();
        let net = t.state.net.lock();
        let topic = net.chans.find("#x").unwrap().topic.clone().unwrap();
        assert_eq!(topic.text, "newest");
        assert_eq!(topic.set_by, "eve");
    }

    #[test]
    fn lmode_appends_entries_under_ts_guard() {
        let mut t = TestNet::new();
        t.dispatch(msg(":002 FJOIN #x 1000 + :")).unwrap();
        t.dispatch(msg(":002 LMODE #x 1000 b *!*@bad joe 900 *!*@worse joe 901"))
            .unwrap();
        t.dispatch(msg(":002 LMODE #x 2000 b *!*@stale joe 902")).unwrap();
        let net = t.state.net.lock();
        let bans = &net.chans.find("#x").unwrap().list_modes[&'b'];
        assert_eq!(bans.len(), 2);
    }

    #[test]
    fn metadata_lands_on_users_channels_and_memberships() {
        let mut t = TestNet::new();
        introduce(&mut t, "002AAAAAA", "bob", 500);
        t.dispatch(msg(":002 FJOIN #x 1000 + :,002AAAAAA")).unwrap();
        t.dispatch(msg(":002 METADATA 002AAAAAA accountname :bob")).unwrap();
        t.dispatch(msg(":002 METADATA #x url :https://example.net")).unwrap();
        t.dispatch(msg(":002 METADATA #x 002AAAAAA joined-via :invite")).unwrap();
        let net = t.state.net.lock();
        let uid = "002AAAAAA".parse().unwrap();
        assert_eq!(
            net.users.find_by_uuid(&uid).unwrap().metadata["accountname"],
            "bob"
        );
        let chan = net.chans.find("#x").unwrap();
        assert_eq!(chan.metadata["url"], "https://example.net");
        assert_eq!(chan.members[&uid].metadata["joined-via"], "invite");
    }

    #[test]
    fn ijoin_for_unknown_channel_requests_resync() {
        let mut t = TestNet::new();
        introduce(&mut t, "002AAAAAA", "bob", 500);
        t.sent();
        t.dispatch(msg(":002AAAAAA IJOIN #new 1234")).unwrap();
        let sent = t.sent();
        assert!(
            sent.iter().any(|l| l == ":001 RESYNC #new"),
            "expected a RESYNC request, got {sent:?}"
        );
        let net = t.state.net.lock();
        assert!(net.chans.find("#new").unwrap().members.contains_key(&"002AAAAAA".parse().unwrap()));
    }
}
