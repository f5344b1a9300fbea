//! The netburst: after a link authenticates, serialize our whole view
//! of the network — servers, users, channels, X-lines — between
//! `BURST` and `ENDBURST`, in an order where nothing ever references
//! something not yet introduced.

use arbor_proto::{CmdBuilder, MAX_LINE_LENGTH};

use crate::state::Network;
use crate::state::user::User;
use crate::tree::ServerHandle;

/// Seconds of clock skew that abort a link outright.
pub const MAX_CLOCK_SKEW_SECS: u64 = 600;

/// Seconds of clock skew that only warn.
pub const WARN_CLOCK_SKEW_SECS: u64 = 30;

/// The complete burst toward the peer behind `exclude`, ready to
/// send, `BURST` first and `ENDBURST` last.
pub fn burst_lines(net: &Network, exclude: ServerHandle, now_secs: u64) -> Vec<String> {
    let sid = net.sid().to_string();
    let mut out = Vec::new();
    out.push(CmdBuilder::new(&sid, "BURST").push_int(now_secs).finalize());
    send_servers(net, net.tree.root(), exclude, &mut out);
    send_users(net, &mut out);
    for chan in sorted_channels(net) {
        sync_channel(net, chan, &mut out);
    }
    for line in net.xlines.burstable(now_secs) {
        out.push(
            CmdBuilder::new(&sid, "ADDLINE")
                .push(&line.kind)
                .push(&line.mask)
                .push(&line.setter)
                .push_int(line.set_ts)
                .push_int(line.duration)
                .push_last(&line.reason)
                .finalize(),
        );
    }
    out.push(CmdBuilder::new(&sid, "ENDBURST").finalize());
    out
}

/// Recursively introduces the tree under `current`, skipping the peer
/// being bursted to. Version info precedes each server's children.
fn send_servers(net: &Network, current: ServerHandle, exclude: ServerHandle, out: &mut Vec<String>) {
    let Some(node) = net.tree.get_live(current) else {
        return;
    };
    let sid = node.sid.to_string();
    out.push(CmdBuilder::new(&sid, "SINFO").push("customversion").push_last(&node.customversion).finalize());
    out.push(CmdBuilder::new(&sid, "SINFO").push("rawbranch").push_last(&node.rawbranch).finalize());
    out.push(CmdBuilder::new(&sid, "SINFO").push("rawversion").push_last(&node.rawversion).finalize());
    for &child in &node.children {
        if child == exclude {
            continue;
        }
        let Some(child_node) = net.tree.get_live(child) else {
            continue;
        };
        let mut builder = CmdBuilder::new(&sid, "SERVER")
            .push(&child_node.name)
            .push(child_node.sid.to_string());
        if child_node.is_bursting() {
            builder = builder.push(format!("burst={}", child_node.burst_start_ms));
        }
        if child_node.hidden {
            builder = builder.push("hidden=1");
        }
        out.push(builder.push_last(&child_node.description).finalize());
        send_servers(net, child, exclude, out);
    }
}

fn send_users(net: &Network, out: &mut Vec<String>) {
    let mut users: Vec<&User> = net.users.iter().collect();
    users.sort_by(|a, b| a.uid.cmp(&b.uid));
    for user in users {
        let sid = user.server().to_string();
        out.push(
            CmdBuilder::new(&sid, "UID")
                .push(user.uid.to_string())
                .push_int(user.nick_ts)
                .push(&user.nick)
                .push(&user.host)
                .push(&user.dhost)
                .push(&user.ident)
                .push(&user.ip)
                .push_int(user.signon)
                .push(format!("+{}", user.modes))
                .push_last(&user.realname)
                .finalize(),
        );
        if let Some(ref oper) = user.oper {
            let mut builder = CmdBuilder::new(user.uid.to_string(), "OPERTYPE")
                .push_last(&oper.name)
                .add_tag("~name", &oper.name);
            for (tag, value) in [
                ("~chanmodes", &oper.chanmodes),
                ("~usermodes", &oper.usermodes),
                ("~snomasks", &oper.snomasks),
                ("~commands", &oper.commands),
                ("~privileges", &oper.privileges),
            ] {
                if let Some(v) = value {
                    builder = builder.add_tag(tag, v);
                }
            }
            out.push(builder.finalize());
        }
        if let Some((away_ts, ref msg)) = user.away {
            out.push(
                CmdBuilder::new(user.uid.to_string(), "AWAY")
                    .push_int(away_ts)
                    .push_last(msg)
                    .finalize(),
            );
        }
        for (key, value) in sorted_metadata(&user.metadata) {
            out.push(
                CmdBuilder::new(&sid, "METADATA")
                    .push(user.uid.to_string())
                    .push(key)
                    .push_last(value)
                    .finalize(),
            );
        }
    }
}

/// One channel's burst: FJOINs (split to fit the line budget), then
/// topic, list modes and metadata.
fn sync_channel(net: &Network, chan: &crate::state::channel::Channel, out: &mut Vec<String>) {
    let sid = net.sid().to_string();
    out.extend(fjoin_lines(&sid, chan));

    if chan.topic_set != 0 {
        if let Some(ref topic) = chan.topic {
            out.push(
                CmdBuilder::new(&sid, "FTOPIC")
                    .push(&chan.name)
                    .push_int(chan.ts)
                    .push_int(topic.set_ts)
                    .push(&topic.set_by)
                    .push_last(&topic.text)
                    .finalize(),
            );
        }
    }

    for (letter, entries) in &chan.list_modes {
        if entries.is_empty() {
            continue;
        }
        let mut builder = CmdBuilder::new(&sid, "LMODE")
            .push(&chan.name)
            .push_int(chan.ts)
            .push(letter.to_string());
        for entry in entries {
            builder = builder
                .push(&entry.mask)
                .push(&entry.setter)
                .push_int(entry.set_ts);
        }
        out.push(builder.finalize());
    }

    for (key, value) in sorted_metadata(&chan.metadata) {
        out.push(
            CmdBuilder::new(&sid, "METADATA")
                .push(&chan.name)
                .push(key)
                .push_last(value)
                .finalize(),
        );
    }
    let mut members: Vec<_> = chan.members.iter().collect();
    members.sort_by(|a, b| a.0.cmp(b.0));
    for (uid, memb) in members {
        for (key, value) in sorted_metadata(&memb.metadata) {
            out.push(
                CmdBuilder::new(&sid, "METADATA")
                    .push(&chan.name)
                    .push(uid.to_string())
                    .push(key)
                    .push_last(value)
                    .finalize(),
            );
        }
    }
}

/// One or more FJOIN lines carrying every member, each line under the
/// wire budget.
pub fn fjoin_lines(sid: &str, chan: &crate::state::channel::Channel) -> Vec<String> {
    let modes = chan.mode_string();
    let mut members: Vec<String> = {
        let mut pairs: Vec<_> = chan.members.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
            .into_iter()
            .map(|(uid, memb)| format!("{},{}", memb.prefixes, uid))
            .collect()
    };
    if members.is_empty() {
        // An empty channel still bursts its modes so a merge can
        // resolve the TS.
        members.push(String::new());
    }

    let mut lines = Vec::new();
    let mut batch: Vec<String> = Vec::new();
    let mut batch_len = 0usize;
    // Room taken by everything except the member list.
    let overhead = 1 + sid.len() + 1 + 5 + 1 + chan.name.len() + 1 + 20 + 2
        + modes.iter().map(|m| m.len() + 1).sum::<usize>();
    for member in members {
        if !batch.is_empty() && overhead + batch_len + member.len() + 1 > MAX_LINE_LENGTH {
            lines.push(build_fjoin(sid, chan, &modes, &batch));
            batch.clear();
            batch_len = 0;
        }
        batch_len += member.len() + 1;
        batch.push(member);
    }
    lines.push(build_fjoin(sid, chan, &modes, &batch));
    lines
}

fn build_fjoin(sid: &str, chan: &crate::state::channel::Channel, modes: &[String], members: &[String]) -> String {
    let mut builder = CmdBuilder::new(sid, "FJOIN")
        .push(&chan.name)
        .push_int(chan.ts);
    for part in modes {
        builder = builder.push(part.clone());
    }
    builder.push_last(members.join(" ").trim().to_string()).finalize()
}

fn sorted_channels(net: &Network) -> Vec<&crate::state::channel::Channel> {
    let mut chans: Vec<_> = net.chans.iter().collect();
    chans.sort_by(|a, b| a.name.cmp(&b.name));
    chans
}

fn sorted_metadata(map: &std::collections::HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::channel::ListModeEntry;
    use crate::state::xline::XLine;

    fn network() -> Network {
        Network::new("a.example.net", "001".parse().unwrap(), "test server")
    }

    #[test]
    fn burst_is_ordered_and_delimited() {
        let mut net = network();
        let b = net
            .tree
            .add_server(net.tree.root(), "b.example.net", "002".parse().unwrap(), "b", false, Some(1))
            .unwrap();
        let c = net
            .tree
            .add_server(net.tree.root(), "c.example.net", "003".parse().unwrap(), "c", true, Some(2))
            .unwrap();
        let uid = net.add_local_user("alice", "al", "host.example", "10.0.0.1", 1000);
        net.chans.find_or_create("#x", 900).join(uid.clone(), "o");
        net.xlines.add(
            XLine {
                kind: "G".into(),
                mask: "*@bad.example".into(),
                setter: "oper".into(),
                reason: "spam".into(),
                set_ts: 500,
                duration: 0,
            },
            1000,
        );

        let lines = burst_lines(&net, b, 1000);
        assert_eq!(lines.first().unwrap(), ":001 BURST 1000");
        assert_eq!(lines.last().unwrap(), ":001 ENDBURST");

        // The direct peer being bursted to is skipped; c is not.
        assert!(!lines.iter().any(|l| l.contains("SERVER b.example.net")));
        let server_line = lines
            .iter()
            .find(|l| l.contains("SERVER c.example.net"))
            .unwrap();
        assert_eq!(server_line, ":001 SERVER c.example.net 003 hidden=1 :c");
        let _ = c;

        // Producer order: servers before users before channels before
        // X-lines.
        let pos = |needle: &str| lines.iter().position(|l| l.contains(needle)).unwrap();
        assert!(pos("SERVER c.example.net") < pos(" UID "));
        assert!(pos(" UID ") < pos("FJOIN"));
        assert!(pos("FJOIN") < pos("ADDLINE"));

        assert_eq!(
            lines[pos(" UID ")],
            format!(":001 UID {uid} 1000 alice host.example host.example al 10.0.0.1 1000 +i :alice")
        );
        assert_eq!(lines[pos("FJOIN")], format!(":001 FJOIN #x 900 + :o,{uid}"));
        assert_eq!(
            lines[pos("ADDLINE")],
            ":001 ADDLINE G *@bad.example oper 500 0 :spam"
        );
    }

    #[test]
    fn fjoin_splits_across_lines_when_full() {
        let mut chan = crate::state::channel::Channel::new("#big", 100);
        for i in 0..60 {
            let uid: arbor_proto::Uid = format!(
                "001{}{}AAAA",
                char::from(b'A' + (i / 26) as u8),
                char::from(b'A' + (i % 26) as u8)
            )
            .parse()
            .unwrap();
            chan.join(uid, "v");
        }
        let lines = fjoin_lines("001", &chan);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= MAX_LINE_LENGTH);
            assert!(line.starts_with(":001 FJOIN #big 100 "));
        }
        let total: usize = lines
            .iter()
            .map(|l| l.split(':').next_back().unwrap().split(' ').count())
            .sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn topic_and_list_modes_follow_the_fjoin() {
        let mut net = network();
        let chan = net.chans.find_or_create("#x", 900);
        chan.topic = Some(crate::state::channel::Topic {
            text: "hello world".into(),
            set_by: "alice".into(),
            set_ts: 950,
        });
        chan.topic_set = 950;
        chan.add_list_entry(
            'b',
            ListModeEntry {
                mask: "*!*@bad".into(),
                setter: "alice".into(),
                set_ts: 940,
            },
        );
        let lines = burst_lines(&net, net.tree.root(), 1000);
        let ftopic = lines.iter().find(|l| l.contains("FTOPIC")).unwrap();
        assert_eq!(ftopic, ":001 FTOPIC #x 900 950 alice :hello world");
        let lmode = lines.iter().find(|l| l.contains("LMODE")).unwrap();
        assert_eq!(lmode, ":001 LMODE #x 900 b *!*@bad alice 940");
    }
}
