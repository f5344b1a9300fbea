//! Server configuration.
//!
//! Process-level options come from the command line (and environment)
//! via clap; the network layout — link blocks, autoconnect schedules,
//! service servers and tuning options — lives in a TOML file loaded
//! at startup.

use std::net::IpAddr;

use clap::Parser;
use serde::Deserialize;

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "arbor-server", about = "Spanning-tree IRC server")]
pub struct ServerConfig {
    /// Address to accept server links on.
    #[arg(long, default_value = "127.0.0.1:7000", env = "ARBOR_LISTEN")]
    pub listen_addr: String,

    /// Our server name. DNS-like, must contain a dot.
    #[arg(long, default_value = "arbor.example.net", env = "ARBOR_SERVER_NAME")]
    pub server_name: String,

    /// Our server ID: three characters, first a digit.
    #[arg(long, default_value = "001", env = "ARBOR_SID")]
    pub sid: String,

    /// Free-text server description.
    #[arg(long, default_value = "An arbor IRC server")]
    pub description: String,

    /// Path to the network configuration file (links, autoconnect,
    /// services, options).
    #[arg(long, env = "ARBOR_NETWORK_CONFIG")]
    pub network_config: Option<String>,

    /// Additional address to accept TLS server links on. Requires
    /// `tls_cert` and `tls_key`.
    #[arg(long, env = "ARBOR_TLS_LISTEN")]
    pub tls_listen_addr: Option<String>,

    /// TLS certificate chain for link TLS (PEM).
    #[arg(long, env = "ARBOR_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// TLS private key for link TLS (PEM).
    #[arg(long, env = "ARBOR_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Parsed network configuration. Populated from `network_config`
    /// after argument parsing.
    #[clap(skip)]
    pub network: NetworkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7000".to_string(),
            server_name: "arbor.example.net".to_string(),
            sid: "001".to_string(),
            description: "An arbor IRC server".to_string(),
            network_config: None,
            tls_listen_addr: None,
            tls_cert: None,
            tls_key: None,
            network: NetworkConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads the TOML network configuration named by `network_config`,
    /// if any.
    pub fn load_network(&mut self) -> anyhow::Result<()> {
        if let Some(ref path) = self.network_config {
            let text = std::fs::read_to_string(path)?;
            self.network = toml::from_str(&text)?;
        }
        Ok(())
    }

    /// The link block for a peer, looked up case-insensitively by
    /// server name.
    pub fn find_link(&self, name: &str) -> Option<&LinkBlock> {
        self.network
            .link
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }
}

/// The network configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub link: Vec<LinkBlock>,
    #[serde(default)]
    pub autoconnect: Vec<AutoconnectBlock>,
    #[serde(default)]
    pub services: Vec<ServicesBlock>,
    #[serde(default)]
    pub options: Options,
}

impl NetworkConfig {
    /// True if `name` names a configured service (U-lined) server.
    pub fn is_service(&self, name: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.server.eq_ignore_ascii_case(name))
    }

    /// True if `name` names a silent service server.
    pub fn is_silent_service(&self, name: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.server.eq_ignore_ascii_case(name) && s.silent)
    }
}

/// One `[[link]]` block: a peer we may connect to or accept from.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// Server name of the peer.
    pub name: String,
    /// Address to dial for outbound connections.
    pub ipaddr: Option<String>,
    pub port: Option<u16>,
    /// Password sent in our SERVER line.
    pub sendpass: String,
    /// Password expected in theirs.
    pub recvpass: String,
    /// Pinned TLS certificate fingerprints (hex SHA-256). Any match
    /// passes.
    #[serde(default)]
    pub fingerprint: Vec<String>,
    /// TLS hook name. `"rustls"` enables TLS on this link.
    pub ssl: Option<String>,
    /// Local address to bind outbound connections to.
    pub bind: Option<String>,
    /// Handshake timeout in seconds.
    #[serde(default = "default_link_timeout")]
    pub timeout: u64,
    /// Hide this server from non-oper MAP/LINKS.
    #[serde(default)]
    pub hidden: bool,
    /// Hide this link block from STATS output.
    #[serde(default)]
    pub statshidden: bool,
    /// CIDR masks inbound connections for this block must match.
    #[serde(default)]
    pub allowmask: Vec<String>,
}

fn default_link_timeout() -> u64 {
    30
}

impl LinkBlock {
    /// True when `ip` matches one of the allowmask entries, or when no
    /// masks are configured.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.allowmask.is_empty() {
            return true;
        }
        self.allowmask.iter().any(|mask| cidr_match(ip, mask))
    }
}

/// One `[[autoconnect]]` block: a failover list tried periodically.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoconnectBlock {
    /// Seconds between connection rounds. Must be > 0.
    pub period: u64,
    /// Space-separated link names, tried in order.
    pub server: String,
}

impl AutoconnectBlock {
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.server.split_whitespace()
    }
}

/// One `[[services]]` block: a U-lined pseudo-server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesBlock {
    pub server: String,
    #[serde(default)]
    pub silent: bool,
}

/// Tuning options for the spanning tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Render MAP as a flat list instead of a tree.
    pub flatlinks: bool,
    /// Mask netsplit quit reasons as `*.net *.split`.
    pub hidesplits: bool,
    /// Hide U-lined servers from MAP/LINKS.
    pub hideservices: bool,
    /// Announce channel TS changes to the channel.
    pub announcets: bool,
    /// Seconds after a PING before a latency warning. 0 disables the
    /// warning step.
    pub pingwarning: u64,
    /// Seconds between server PINGs.
    pub serverpingfreq: u64,
    /// Suppress oper notices for events behind an unfinished burst.
    pub quietbursts: bool,
    /// Tolerate optional-module and extban list mismatches.
    pub allowmismatch: bool,
    /// Masked hostname applied when only the displayed host changed.
    pub cyclehostsfromuser: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flatlinks: false,
            hidesplits: false,
            hideservices: false,
            announcets: true,
            pingwarning: 15,
            serverpingfreq: 60,
            quietbursts: true,
            allowmismatch: true,
            cyclehostsfromuser: false,
        }
    }
}

/// Simple CIDR match. A bare address is an exact match; a
/// `prefix/len` form matches the leading `len` bits.
pub fn cidr_match(ip: IpAddr, mask: &str) -> bool {
    let (prefix, len) = match mask.split_once('/') {
        Some((p, l)) => match l.parse::<u32>() {
            Ok(len) => (p, len),
            Err(_) => return false,
        },
        None => (mask, u32::MAX),
    };
    let Ok(prefix) = prefix.parse::<IpAddr>() else {
        return false;
    };
    let (ip_bits, prefix_bits, width) = match (ip, prefix) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            (u128::from(u32::from(a)), u128::from(u32::from(b)), 32u32)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => (u128::from(a), u128::from(b), 128u32),
        _ => return false,
    };
    let len = len.min(width);
    if len == 0 {
        return true;
    }
    let shift = width - len;
    (ip_bits >> shift) == (prefix_bits >> shift)
}

/// True for addresses that may link without TLS: loopback, RFC 1918
/// ranges, link-local and unique-local space.
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_toml() {
        let text = r#"
            [[link]]
            name = "hub.example.net"
            ipaddr = "10.0.0.2"
            port = 7000
            sendpass = "out"
            recvpass = "in"
            hidden = true
            allowmask = ["10.0.0.0/8"]

            [[autoconnect]]
            period = 60
            server = "hub.example.net spare.example.net"

            [[services]]
            server = "services.example.net"
            silent = true

            [options]
            hidesplits = true
            serverpingfreq = 120
        "#;
        let net: NetworkConfig = toml::from_str(text).unwrap();
        assert_eq!(net.link.len(), 1);
        assert_eq!(net.link[0].timeout, 30);
        assert!(net.link[0].hidden);
        assert_eq!(
            net.autoconnect[0].servers().collect::<Vec<_>>(),
            vec!["hub.example.net", "spare.example.net"]
        );
        assert!(net.is_service("SERVICES.example.net"));
        assert!(net.is_silent_service("services.example.net"));
        assert!(net.options.hidesplits);
        assert_eq!(net.options.serverpingfreq, 120);
        assert_eq!(net.options.pingwarning, 15);
    }

    #[test]
    fn load_network_reads_the_named_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[link]]\nname = \"hub.example.net\"\nsendpass = \"o\"\nrecvpass = \"i\"\n"
        )
        .unwrap();
        let mut config = ServerConfig {
            network_config: Some(file.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        config.load_network().unwrap();
        assert!(config.find_link("HUB.example.net").is_some());
    }

    #[test]
    fn cidr_matching() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(cidr_match(ip, "10.0.0.0/8"));
        assert!(!cidr_match(ip, "10.2.0.0/16"));
        assert!(cidr_match(ip, "10.1.2.3"));
        assert!(!cidr_match(ip, "10.1.2.4"));
        assert!(cidr_match(ip, "0.0.0.0/0"));
        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert!(cidr_match(v6, "fd00::/8"));
        assert!(!cidr_match(v6, "10.0.0.0/8"));
    }

    #[test]
    fn local_ranges() {
        assert!(is_local_ip("127.0.0.1".parse().unwrap()));
        assert!(is_local_ip("192.168.1.10".parse().unwrap()));
        assert!(is_local_ip("fe80::1".parse().unwrap()));
        assert!(!is_local_ip("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn link_allowmask() {
        let block = LinkBlock {
            name: "hub.example.net".into(),
            ipaddr: None,
            port: None,
            sendpass: "a".into(),
            recvpass: "b".into(),
            fingerprint: Vec::new(),
            ssl: None,
            bind: None,
            timeout: 30,
            hidden: false,
            statshidden: false,
            allowmask: vec!["10.0.0.0/8".into()],
        };
        assert!(block.allows("10.9.9.9".parse().unwrap()));
        assert!(!block.allows("11.0.0.1".parse().unwrap()));
    }
}
