//! X-line replication: ADDLINE and DELLINE.

use arbor_proto::Message;

use crate::error::{CmdResult, ProtocolViolation, extract_ts};
use crate::state::xline::{AddLineResult, XLine};
use crate::util::now_secs;

use super::{Ctx, Source};

/// `ADDLINE <type> <mask> <setter> <set-ts> <duration> :<reason>`
pub fn handle_addline(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    let line = XLine {
        kind: msg.params[0].clone(),
        mask: msg.params[1].clone(),
        setter: msg.params[2].clone(),
        set_ts: extract_ts(&msg.params[3])?,
        duration: msg.params[4]
            .parse()
            .map_err(|_| ProtocolViolation::new(format!("Invalid duration {}", msg.params[4])))?,
        reason: msg.params[5].clone(),
    };
    let kind = line.kind.clone();
    let mask = line.mask.clone();
    match ctx.net.xlines.add(line, now_secs()) {
        AddLineResult::Added => {
            tracing::info!(kind = %kind, mask = %mask, "X-line added from network");
            Ok(CmdResult::Success)
        }
        AddLineResult::OlderWins => {
            tracing::debug!(kind = %kind, mask = %mask, "X-line conflict, keeping the older entry");
            Ok(CmdResult::Failure)
        }
        AddLineResult::Expired => Ok(CmdResult::Failure),
    }
}

/// `DELLINE <type> <mask>`
pub fn handle_delline(
    ctx: &mut Ctx,
    _source: &Source,
    msg: &mut Message,
) -> Result<CmdResult, ProtocolViolation> {
    match ctx.net.xlines.remove(&msg.params[0], &msg.params[1]) {
        Some(line) => {
            tracing::info!(kind = %line.kind, mask = %line.mask, "X-line removed from network");
            Ok(CmdResult::Success)
        }
        None => Ok(CmdResult::Failure),
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::dispatch_test_support::{TestNet, msg};

    #[test]
    fn addline_then_delline() {
        let mut t = TestNet::new();
        t.dispatch(msg(":002 ADDLINE G *@bad.example oper 1000 0 :spam")).unwrap();
        {
            let net = t.state.net.lock();
            let line = net.xlines.find("G", "*@bad.example").unwrap();
            assert_eq!(line.reason, "spam");
            assert_eq!(line.duration, 0);
        }
        t.dispatch(msg(":002 DELLINE G *@bad.example")).unwrap();
        let net = t.state.net.lock();
        assert!(net.xlines.find("G", "*@bad.example").is_none());
    }

    #[test]
    fn conflicting_addline_keeps_older_and_suppresses_forwarding() {
        let mut t = TestNet::new();
        let (_, mut c_rx) = t.add_peer_c();
        t.dispatch(msg(":002 ADDLINE G *@bad.example oper 1000 0 :first")).unwrap();
        t.dispatch(msg(":002 ADDLINE G *@bad.example other 2000 0 :late")).unwrap();
        {
            let net = t.state.net.lock();
            assert_eq!(net.xlines.find("G", "*@bad.example").unwrap().set_ts, 1000);
        }
        let mut c_lines = Vec::new();
        while let Ok(line) = c_rx.try_recv() {
            c_lines.push(line.trim_end().to_string());
        }
        assert_eq!(
            c_lines.iter().filter(|l| l.contains("ADDLINE")).count(),
            1,
            "the losing duplicate must not propagate: {c_lines:?}"
        );
    }
}
