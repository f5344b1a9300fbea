//! The `CAPAB START … END` exchange: protocol version gate, module
//! and mode list comparison, HMAC challenge-response and the SERVER
//! credential check.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use arbor_proto::{MIN_PROTO_VERSION, PROTO_VERSION};

use crate::config::{LinkBlock, Options};
use crate::error::ProtocolViolation;

/// Modules whose presence must match exactly on both sides.
pub const COMMON_MODULES: &[&str] = &["spanningtree"];

/// Modules that only warn on mismatch (unless mismatches are fatal
/// by configuration).
pub const OPT_MODULES: &[&str] = &["metadata", "xline"];

/// Channel mode list, compared verbatim.
pub const CHAN_MODES: &str =
    "ban=b exemption=e invite-only=i key=k limit=l moderated=m noextmsg=n op=@o private=p secret=s topiclock=t voice=+v";

/// User mode list, compared verbatim.
pub const USER_MODES: &str = "invisible=i oper=o snomask=s wallops=w";

/// Extban list; empty means extbans are not configured.
pub const EXTBANS: &str = "";

pub const CASEMAPPING: &str = "rfc1459";

/// Negotiation scratch space. Populated only while the link is in a
/// WAIT_AUTH state and discarded when the burst begins.
#[derive(Debug, Default)]
pub struct Negotiation {
    pub proto_version: Option<u16>,
    pub capabilities: HashMap<String, String>,
    pub modules: Option<String>,
    pub opt_modules: Option<String>,
    pub chan_modes: Option<String>,
    pub user_modes: Option<String>,
    pub extbans: Option<String>,
    /// The challenge we sent them.
    pub our_challenge: String,
    /// The peer's SERVER claims, pending acceptance.
    pub remote_name: Option<String>,
    pub remote_sid: Option<String>,
    pub remote_desc: Option<String>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            our_challenge: arbor_proto::id::random_challenge(20),
            ..Default::default()
        }
    }

    /// The challenge they sent us, if any.
    pub fn their_challenge(&self) -> Option<&str> {
        self.capabilities.get("CHALLENGE").map(String::as_str)
    }
}

/// The full CAPAB block we advertise, `START` through `END`.
pub fn capab_block(neg: &Negotiation) -> Vec<String> {
    let capabilities = [
        ("CASEMAPPING", CASEMAPPING.to_string()),
        ("CHALLENGE", neg.our_challenge.clone()),
        ("MAXAWAY", "200".to_string()),
        ("MAXCHANNEL", "64".to_string()),
        ("MAXHOST", "64".to_string()),
        ("MAXKICK", "255".to_string()),
        ("MAXLINE", "512".to_string()),
        ("MAXMODES", "20".to_string()),
        ("MAXNICK", "30".to_string()),
        ("MAXQUIT", "255".to_string()),
        ("MAXREAL", "128".to_string()),
        ("MAXTOPIC", "307".to_string()),
        ("MAXUSER", "10".to_string()),
    ];
    let caps = capabilities
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = vec![
        format!("CAPAB START {PROTO_VERSION}"),
        format!("CAPAB CAPABILITIES :{caps}"),
        format!("CAPAB MODULES :{}", COMMON_MODULES.join(" ")),
        format!("CAPAB MODSUPPORT :{}", OPT_MODULES.join(" ")),
        format!("CAPAB CHANMODES :{CHAN_MODES}"),
        format!("CAPAB USERMODES :{USER_MODES}"),
    ];
    if !EXTBANS.is_empty() {
        out.push(format!("CAPAB EXTBANS :{EXTBANS}"));
    }
    out.push("CAPAB END".to_string());
    out
}

/// Outcome of one CAPAB subcommand.
#[derive(Debug, PartialEq, Eq)]
pub enum CapabProgress {
    /// Still collecting.
    InProgress,
    /// `CAPAB START` was just received; an inbound socket replies
    /// with its own block now.
    Started,
    /// `CAPAB END` received and the compatibility checks passed.
    Complete,
}

/// Applies one `CAPAB` subcommand to the scratch space.
pub fn handle_capab(
    neg: &mut Negotiation,
    options: &Options,
    params: &[String],
) -> Result<CapabProgress, ProtocolViolation> {
    let sub = params
        .first()
        .ok_or_else(|| ProtocolViolation::new("CAPAB without a subcommand"))?;
    let arg = params.get(1).map(String::as_str).unwrap_or("");
    match sub.to_ascii_uppercase().as_str() {
        "START" => {
            let version: u16 = arg
                .parse()
                .map_err(|_| ProtocolViolation::new(format!("Invalid protocol version {arg:?}")))?;
            if version < MIN_PROTO_VERSION {
                return Err(ProtocolViolation::new(format!(
                    "Protocol version {version} is too old; this server speaks {MIN_PROTO_VERSION} through {PROTO_VERSION}"
                )));
            }
            neg.proto_version = Some(version);
            Ok(CapabProgress::Started)
        }
        "CAPABILITIES" => {
            for pair in arg.split_whitespace() {
                match pair.split_once('=') {
                    Some((k, v)) => neg.capabilities.insert(k.to_string(), v.to_string()),
                    None => neg.capabilities.insert(pair.to_string(), String::new()),
                };
            }
            Ok(CapabProgress::InProgress)
        }
        "MODULES" => {
            append_list(&mut neg.modules, arg);
            Ok(CapabProgress::InProgress)
        }
        "MODSUPPORT" => {
            append_list(&mut neg.opt_modules, arg);
            Ok(CapabProgress::InProgress)
        }
        "CHANMODES" => {
            neg.chan_modes = Some(arg.to_string());
            Ok(CapabProgress::InProgress)
        }
        "USERMODES" => {
            neg.user_modes = Some(arg.to_string());
            Ok(CapabProgress::InProgress)
        }
        "EXTBANS" => {
            neg.extbans = Some(arg.to_string());
            Ok(CapabProgress::InProgress)
        }
        "END" => {
            if neg.proto_version.is_none() {
                return Err(ProtocolViolation::new("CAPAB END before CAPAB START"));
            }
            check_compatibility(neg, options).map_err(ProtocolViolation::new)?;
            Ok(CapabProgress::Complete)
        }
        // Unknown subcommands are forward compatibility, not errors.
        _ => Ok(CapabProgress::InProgress),
    }
}

fn append_list(slot: &mut Option<String>, arg: &str) {
    match slot {
        Some(existing) => {
            existing.push(' ');
            existing.push_str(arg);
        }
        None => *slot = Some(arg.to_string()),
    }
}

/// Compares the peer's advertised lists against ours. An `Err` is the
/// `ERROR` text that kills the link.
pub fn check_compatibility(neg: &Negotiation, options: &Options) -> Result<(), String> {
    // A peer that sent no list at all is a legacy peer; only sent
    // lists are compared.
    if neg.modules.is_some() {
        if let Some(diff) = list_diff(COMMON_MODULES, neg.modules.as_deref()) {
            return Err(format!("Link modules not matched on both sides:{diff}"));
        }
    }
    if neg.opt_modules.is_some() {
        if let Some(diff) = list_diff(OPT_MODULES, neg.opt_modules.as_deref()) {
            if options.allowmismatch {
                tracing::warn!(diff = %diff, "optional module lists differ");
            } else {
                return Err(format!("Optional modules not matched on both sides:{diff}"));
            }
        }
    }
    if let Some(theirs) = neg.chan_modes.as_deref() {
        if theirs != CHAN_MODES {
            return Err(format!(
                "Channel modes not matched on both sides: got {theirs:?}, expected {CHAN_MODES:?}"
            ));
        }
    }
    if let Some(theirs) = neg.user_modes.as_deref() {
        if theirs != USER_MODES {
            return Err(format!(
                "User modes not matched on both sides: got {theirs:?}, expected {USER_MODES:?}"
            ));
        }
    }
    if let Some(theirs) = neg.extbans.as_deref() {
        if theirs != EXTBANS && !options.allowmismatch {
            return Err("Extban lists not matched on both sides".to_string());
        }
    }
    if let Some(mapping) = neg.capabilities.get("CASEMAPPING") {
        if mapping != CASEMAPPING {
            return Err(format!(
                "Casemapping not matched on both sides: got {mapping:?}, expected {CASEMAPPING:?}"
            ));
        }
    }
    Ok(())
}

/// Two-way diff of a space-separated list against ours. `None` when
/// they match as sets.
fn list_diff(ours: &[&str], theirs: Option<&str>) -> Option<String> {
    let theirs: Vec<&str> = theirs.unwrap_or("").split_whitespace().collect();
    let missing_there: Vec<&str> = ours
        .iter()
        .copied()
        .filter(|m| !theirs.contains(m))
        .collect();
    let missing_here: Vec<&str> = theirs
        .iter()
        .copied()
        .filter(|m| !ours.contains(m))
        .collect();
    if missing_here.is_empty() && missing_there.is_empty() {
        return None;
    }
    let mut out = String::new();
    if !missing_here.is_empty() {
        out.push_str(" Not loaded here:");
        for m in missing_here {
            out.push(' ');
            out.push_str(m);
        }
        out.push('.');
    }
    if !missing_there.is_empty() {
        out.push_str(" Not loaded there:");
        for m in missing_there {
            out.push(' ');
            out.push_str(m);
        }
        out.push('.');
    }
    Some(out)
}

/// `AUTH:` + base64(HMAC-SHA256(password, challenge)). Falls back to
/// the plaintext password when there is no challenge to respond to.
pub fn make_pass(password: &str, challenge: Option<&str>) -> String {
    let Some(challenge) = challenge.filter(|c| !c.is_empty()) else {
        return password.to_string();
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    format!("AUTH:{}", BASE64.encode(mac.finalize().into_bytes()))
}

/// Constant-time string equality. Length is not secret.
fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Validates the password from a peer's SERVER line, via the
/// challenge exchange when both sides advertised one, otherwise by
/// constant-time plaintext comparison.
pub fn compare_pass(link: &LinkBlock, neg: &Negotiation, theirs: &str) -> bool {
    if neg.their_challenge().is_some() {
        // They hashed our recvpass under the challenge we issued.
        let expected = make_pass(&link.recvpass, Some(&neg.our_challenge));
        ct_eq(&expected, theirs)
    } else {
        ct_eq(&link.recvpass, theirs)
    }
}

/// Checks a pinned certificate fingerprint. With no pins configured,
/// anything (including no TLS at all) passes.
pub fn check_fingerprint(link: &LinkBlock, presented: Option<&str>) -> Result<(), String> {
    if link.fingerprint.is_empty() {
        return Ok(());
    }
    let Some(presented) = presented else {
        return Err(format!(
            "Link {} requires a pinned TLS certificate but none was presented",
            link.name
        ));
    };
    if link
        .fingerprint
        .iter()
        .any(|pin| ct_eq(&pin.to_lowercase(), &presented.to_lowercase()))
    {
        Ok(())
    } else {
        Err(format!(
            "Invalid TLS certificate fingerprint on link {}: got {presented}",
            link.name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated() -> Negotiation {
        let mut neg = Negotiation::new();
        let options = Options::default();
        // Feed our own block back in: a server always matches itself.
        let lines = capab_block(&neg);
        for line in lines {
            let mut params: Vec<String> = Vec::new();
            let rest = line.strip_prefix("CAPAB ").unwrap();
            match rest.split_once(" :") {
                Some((sub, arg)) => {
                    params.push(sub.to_string());
                    params.push(arg.to_string());
                }
                None => {
                    for word in rest.split(' ') {
                        params.push(word.to_string());
                    }
                }
            }
            handle_capab(&mut neg, &options, &params).unwrap();
        }
        neg
    }

    #[test]
    fn a_server_matches_its_own_block() {
        let neg = negotiated();
        assert_eq!(neg.proto_version, Some(PROTO_VERSION));
        assert!(neg.their_challenge().is_some());
    }

    #[test]
    fn old_protocol_versions_are_rejected() {
        let mut neg = Negotiation::new();
        let err = handle_capab(
            &mut neg,
            &Options::default(),
            &["START".to_string(), "1105".to_string()],
        )
        .unwrap_err();
        assert!(err.0.contains("too old"));
    }

    #[test]
    fn module_mismatch_kills_with_a_diff_report() {
        let mut neg = Negotiation::new();
        let options = Options::default();
        handle_capab(&mut neg, &options, &["START".into(), "1207".into()]).unwrap();
        handle_capab(
            &mut neg,
            &options,
            &["MODULES".into(), "spanningtree shun".into()],
        )
        .unwrap();
        let err = handle_capab(&mut neg, &options, &["END".into()]).unwrap_err();
        assert!(err.0.contains("Not loaded here: shun"), "{}", err.0);
    }

    #[test]
    fn optional_module_mismatch_respects_allowmismatch() {
        let mut neg = Negotiation::new();
        neg.proto_version = Some(PROTO_VERSION);
        neg.modules = Some(COMMON_MODULES.join(" "));
        neg.opt_modules = Some("metadata".to_string());
        assert!(check_compatibility(&neg, &Options::default()).is_ok());
        let strict = Options {
            allowmismatch: false,
            ..Options::default()
        };
        assert!(check_compatibility(&neg, &strict).is_err());
    }

    #[test]
    fn chanmode_mismatch_is_fatal() {
        let mut neg = Negotiation::new();
        neg.proto_version = Some(PROTO_VERSION);
        neg.modules = Some(COMMON_MODULES.join(" "));
        neg.opt_modules = Some(OPT_MODULES.join(" "));
        neg.chan_modes = Some("ban=b".to_string());
        assert!(check_compatibility(&neg, &Options::default()).is_err());
    }

    #[test]
    fn casemapping_must_match() {
        let mut neg = Negotiation::new();
        neg.proto_version = Some(PROTO_VERSION);
        neg.modules = Some(COMMON_MODULES.join(" "));
        neg.opt_modules = Some(OPT_MODULES.join(" "));
        neg.capabilities
            .insert("CASEMAPPING".to_string(), "ascii".to_string());
        assert!(check_compatibility(&neg, &Options::default()).is_err());
    }

    #[test]
    fn challenge_response_round_trip() {
        // Side A issues a challenge; side B proves knowledge of the
        // password without sending it.
        let challenge = "abcdefghij0123456789";
        let proof = make_pass("linkpass", Some(challenge));
        assert!(proof.starts_with("AUTH:"));
        assert_ne!(proof, make_pass("linkpass", Some("different")));
        assert_ne!(proof, make_pass("wrongpass", Some(challenge)));

        let link = LinkBlock {
            name: "b.example.net".into(),
            ipaddr: None,
            port: None,
            sendpass: "out".into(),
            recvpass: "linkpass".into(),
            fingerprint: Vec::new(),
            ssl: None,
            bind: None,
            timeout: 30,
            hidden: false,
            statshidden: false,
            allowmask: Vec::new(),
        };
        let mut neg = Negotiation::new();
        neg.our_challenge = challenge.to_string();
        neg.capabilities
            .insert("CHALLENGE".to_string(), "their-challenge-here".to_string());
        assert!(compare_pass(&link, &neg, &proof));
        assert!(!compare_pass(&link, &neg, "AUTH:bogus"));
    }

    #[test]
    fn plaintext_fallback_when_no_challenge() {
        let link = LinkBlock {
            name: "b.example.net".into(),
            ipaddr: None,
            port: None,
            sendpass: "out".into(),
            recvpass: "secret".into(),
            fingerprint: Vec::new(),
            ssl: None,
            bind: None,
            timeout: 30,
            hidden: false,
            statshidden: false,
            allowmask: Vec::new(),
        };
        let neg = Negotiation::new();
        assert!(compare_pass(&link, &neg, "secret"));
        assert!(!compare_pass(&link, &neg, "Secret"));
    }

    #[test]
    fn fingerprint_pinning() {
        let mut link = LinkBlock {
            name: "b.example.net".into(),
            ipaddr: None,
            port: None,
            sendpass: "o".into(),
            recvpass: "i".into(),
            fingerprint: vec!["AABBCC".into()],
            ssl: Some("rustls".into()),
            bind: None,
            timeout: 30,
            hidden: false,
            statshidden: false,
            allowmask: Vec::new(),
        };
        assert!(check_fingerprint(&link, Some("aabbcc")).is_ok());
        assert!(check_fingerprint(&link, Some("ddeeff")).is_err());
        assert!(check_fingerprint(&link, None).is_err());
        link.fingerprint.clear();
        assert!(check_fingerprint(&link, None).is_ok());
    }
}
