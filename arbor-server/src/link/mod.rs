//! Per-peer link sockets: the connect/handshake/connected/dying state
//! machine, the send queue and writer task, the negotiation driver
//! and the ping cycle.

pub mod capab;
pub mod tls;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use arbor_proto::{MAX_LINE_LENGTH, MAX_TAG_LENGTH, Message, MessageError, Sid};

use crate::burst;
use crate::config::is_local_ip;
use crate::error::{LinkError, ProtocolViolation};
use crate::netsplit;
use crate::server::{LinkHandle, SharedState};
use crate::tree::ServerHandle;
use crate::util::now_ms;
use capab::{CapabProgress, Negotiation};

/// Link socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound connect in flight.
    Connecting,
    /// CAPAB sent, waiting for the peer's CAPAB END and SERVER.
    WaitAuth1,
    /// Their SERVER accepted and ours sent; waiting for BURST.
    WaitAuth2,
    /// Authenticated both ways; regular traffic flows.
    Connected,
    /// Terminal. Pending output drains, nothing new is processed.
    Dying,
}

/// Where the ping cycle is for a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingPhase {
    SendPing,
    Warn,
    Timeout,
}

/// Everything one link task tracks outside the shared state.
struct LinkSession {
    state: Arc<SharedState>,
    handle: LinkHandle,
    link_state: LinkState,
    neg: Negotiation,
    /// The link block name we dialed, for outbound links.
    dialed: Option<String>,
    peer_ip: IpAddr,
    is_tls: bool,
    fingerprint: Option<String>,
    /// The direct peer's tree node, once CONNECTED.
    peer: Option<ServerHandle>,
    sent_capab: bool,
    ping_phase: PingPhase,
    last_ping_ms: u64,
    /// Absolute deadline for the current phase: negotiation timeout
    /// before CONNECTED, the ping cycle after.
    deadline: Instant,
}

impl LinkSession {
    fn send(&self, line: impl Into<String>) {
        self.state.send_to_link(self.handle.id, line);
    }

    fn options(&self) -> &crate::config::Options {
        &self.state.config.network.options
    }

    fn our_sid(&self) -> String {
        self.state.config.sid.clone()
    }

    /// Seconds a peer gets to finish the handshake.
    fn negotiation_timeout(&self) -> u64 {
        self.dialed
            .as_deref()
            .and_then(|name| self.state.config.find_link(name))
            .map(|block| block.timeout)
            .unwrap_or(30)
    }

    /// Drives one line of the handshake. `Ok(true)` keeps reading,
    /// `Ok(false)` ends the session without an ERROR of our own.
    fn on_handshake_line(&mut self, msg: &Message) -> Result<bool, ProtocolViolation> {
        match msg.command.as_str() {
            "CAPAB" => {
                let options = &self.state.config.network.options;
                let progress = capab::handle_capab(&mut self.neg, options, &msg.params)?;
                match progress {
                    CapabProgress::Started => {
                        if !self.sent_capab {
                            for line in capab::capab_block(&self.neg) {
                                self.send(line);
                            }
                            self.sent_capab = true;
                        }
                    }
                    CapabProgress::Complete => {
                        self.check_transport()?;
                        if self.dialed.is_some() {
                            self.send_server_line()?;
                        }
                    }
                    CapabProgress::InProgress => {}
                }
                Ok(true)
            }
            "SERVER" => {
                self.on_server_line(&msg.params)?;
                Ok(true)
            }
            "BURST" => {
                if self.link_state != LinkState::WaitAuth2 {
                    return Err(ProtocolViolation::new("BURST before authentication"));
                }
                let their_time = msg
                    .params
                    .first()
                    .and_then(|t| t.parse::<u64>().ok())
                    .unwrap_or(0);
                check_clock_skew(their_time, crate::util::now_secs())?;
                let peer = self.finish_auth()?;
                let mut net = self.state.net.lock();
                net.tree.begin_burst(peer, their_time * 1000);
                Ok(true)
            }
            "ERROR" => {
                tracing::warn!(
                    link = %self.handle.label,
                    error = %msg.params.first().map(String::as_str).unwrap_or(""),
                    "peer reported an error during negotiation"
                );
                Ok(false)
            }
            other => Err(ProtocolViolation::new(format!(
                "Command {other} not allowed before registration"
            ))),
        }
    }

    /// Non-local peers must speak TLS, unless we are inside a
    /// container where the pod network is the trust boundary.
    fn check_transport(&self) -> Result<(), ProtocolViolation> {
        if self.is_tls || is_local_ip(self.peer_ip) || std::path::Path::new("/.dockerenv").exists()
        {
            return Ok(());
        }
        Err(ProtocolViolation::new(
            "Server links across public networks require TLS",
        ))
    }

    /// Sends our `SERVER <name> <pass> <sid> :<desc>` credential line.
    fn send_server_line(&mut self) -> Result<(), ProtocolViolation> {
        let block_name = self
            .dialed
            .clone()
            .or_else(|| self.neg.remote_name.clone())
            .ok_or_else(|| ProtocolViolation::new("No link block for this connection"))?;
        let block = self
            .state
            .config
            .find_link(&block_name)
            .ok_or_else(|| ProtocolViolation::new("No link block for this connection"))?;
        let pass = capab::make_pass(&block.sendpass, self.neg.their_challenge());
        self.send(
            arbor_proto::CmdBuilder::new(self.our_sid(), "SERVER")
                .push(&self.state.config.server_name)
                .push(pass)
                .push(&self.state.config.sid)
                .push_last(&self.state.config.description)
                .finalize(),
        );
        Ok(())
    }

    /// Validates a peer's SERVER credential line.
    fn on_server_line(&mut self, params: &[String]) -> Result<(), ProtocolViolation> {
        if self.link_state == LinkState::Connected {
            return Err(ProtocolViolation::new("You may not re-register"));
        }
        if params.len() < 4 {
            return Err(ProtocolViolation::new("Missing parameters to SERVER"));
        }
        let (name, pass, sid, desc) = (&params[0], &params[1], &params[2], &params[3]);
        if !arbor_proto::valid_server_name(name) {
            return Err(ProtocolViolation::new(format!("Invalid servername: {name}")));
        }
        if !Sid::is_valid(sid) {
            return Err(ProtocolViolation::new(format!("Invalid SID: {sid}")));
        }
        if let Some(ref dialed) = self.dialed {
            if !dialed.eq_ignore_ascii_case(name) {
                return Err(ProtocolViolation::new(format!(
                    "Server {name} is not the server we connected to ({dialed})"
                )));
            }
        }
        let Some(block) = self.state.config.find_link(name).cloned() else {
            return Err(ProtocolViolation::new(format!(
                "Server {name} is not configured for linking"
            )));
        };
        if self.dialed.is_none() && !block.allows(self.peer_ip) {
            return Err(ProtocolViolation::new(format!(
                "Connection from {} is not allowed for link {name}",
                self.peer_ip
            )));
        }
        if !capab::compare_pass(&block, &self.neg, pass) {
            return Err(ProtocolViolation::new("Invalid credentials"));
        }
        capab::check_fingerprint(&block, self.fingerprint.as_deref())
            .map_err(ProtocolViolation::new)?;
        {
            let net = self.state.net.lock();
            if net.tree.find_by_name(name).is_some() {
                return Err(ProtocolViolation::new(format!(
                    "Server {name} already exists on the network"
                )));
            }
            if sid.parse::<Sid>().ok().and_then(|s| net.tree.find_by_sid(s)).is_some() {
                return Err(ProtocolViolation::new(format!(
                    "Server ID {sid} already exists on the network"
                )));
            }
        }
        self.neg.remote_name = Some(name.clone());
        self.neg.remote_sid = Some(sid.clone());
        self.neg.remote_desc = Some(desc.clone());

        if self.dialed.is_some() {
            // They answered our SERVER: authenticated both ways. Burst.
            self.finish_auth()?;
        } else {
            // Inbound: reply in kind, then wait for their BURST.
            self.send_server_line()?;
            self.link_state = LinkState::WaitAuth2;
        }
        Ok(())
    }

    /// Creates the peer's tree node, announces the link and sends our
    /// burst. The negotiation scratch is dead after this.
    fn finish_auth(&mut self) -> Result<ServerHandle, ProtocolViolation> {
        let name = self.neg.remote_name.clone().unwrap_or_default();
        let sid: Sid = self
            .neg
            .remote_sid
            .as_deref()
            .unwrap_or("")
            .parse()
            .map_err(|_| ProtocolViolation::new("Invalid SID"))?;
        let desc = self.neg.remote_desc.clone().unwrap_or_default();
        let block = self.state.config.find_link(&name);
        let hidden = block.map(|b| b.hidden).unwrap_or(false);

        let (peer, lines) = {
            let mut net = self.state.net.lock();
            let root = net.tree.root();
            let peer = net
                .tree
                .add_server(root, &name, sid, &desc, hidden, Some(self.handle.id))
                .map_err(|e| ProtocolViolation::new(e.to_string()))?;
            if let Some(node) = net.tree.get_mut(peer) {
                node.service = self.state.config.network.is_service(&name);
                node.silent_service = self.state.config.network.is_silent_service(&name);
            }
            let lines = burst::burst_lines(&net, peer, crate::util::now_secs());
            (peer, lines)
        };
        self.link_state = LinkState::Connected;
        self.peer = Some(peer);

        let auth = if self.neg.their_challenge().is_some() {
            "challenge-response"
        } else {
            "plaintext password"
        };
        tracing::info!(
            link = %self.handle.label,
            server = %name,
            sid = %sid,
            fingerprint = self.fingerprint.is_some(),
            auth,
            "link established, bursting"
        );
        for line in lines {
            self.send(line);
        }
        tracing::info!(link = %self.handle.label, server = %name, "finished bursting");
        self.neg = Negotiation::default();
        self.ping_phase = PingPhase::SendPing;
        self.arm_deadline();
        Ok(peer)
    }

    /// Re-arms the read deadline for the current phase.
    fn arm_deadline(&mut self) {
        let opts = self.options();
        let secs = match self.link_state {
            LinkState::Connected => match self.ping_phase {
                PingPhase::SendPing => opts.serverpingfreq,
                PingPhase::Warn => opts.pingwarning,
                PingPhase::Timeout => opts.serverpingfreq.saturating_sub(opts.pingwarning),
            },
            _ => self.negotiation_timeout(),
        };
        self.deadline = Instant::now() + Duration::from_secs(secs.max(1));
    }

    /// The read deadline fired. `Ok(false)` ends the session.
    fn on_phase_timeout(&mut self) -> Result<bool, String> {
        if self.link_state != LinkState::Connected {
            return Err("Connection timed out during negotiation".to_string());
        }
        let (peer_sid, peer_name) = {
            let net = self.state.net.lock();
            let Some(node) = self.peer.and_then(|p| net.tree.get_live(p)) else {
                return Ok(false);
            };
            (node.sid.to_string(), node.name.clone())
        };
        match self.ping_phase {
            PingPhase::SendPing => {
                self.send(
                    arbor_proto::CmdBuilder::new(self.our_sid(), "PING")
                        .push(peer_sid)
                        .finalize(),
                );
                self.last_ping_ms = now_ms();
                self.ping_phase = if self.options().pingwarning > 0 {
                    PingPhase::Warn
                } else {
                    PingPhase::Timeout
                };
                self.arm_deadline();
                Ok(true)
            }
            PingPhase::Warn => {
                tracing::warn!(
                    server = %peer_name,
                    seconds = self.options().pingwarning,
                    "server has not responded to PING, high latency"
                );
                self.ping_phase = PingPhase::Timeout;
                self.arm_deadline();
                Ok(true)
            }
            PingPhase::Timeout => Err("Ping timeout".to_string()),
        }
    }

    /// Peeks a PONG from the direct peer to close the ping cycle and
    /// record the round-trip time.
    fn maybe_note_pong(&mut self, msg: &Message) {
        if msg.command != "PONG" {
            return;
        }
        let Some(peer) = self.peer else { return };
        let reset = {
            let mut net = self.state.net.lock();
            let Some(node) = net.tree.get_mut(peer) else {
                return;
            };
            let from_peer = msg
                .source
                .as_deref()
                .is_none_or(|src| src == node.sid.as_str());
            let for_us = msg
                .params
                .first()
                .is_none_or(|dest| *dest == self.state.config.sid);
            if from_peer && for_us {
                node.rtt_ms = now_ms().saturating_sub(self.last_ping_ms);
            }
            from_peer && for_us
        };
        if reset {
            self.ping_phase = PingPhase::SendPing;
            self.arm_deadline();
        }
    }
}

/// Checks the peer's wall clock from its BURST line.
pub fn check_clock_skew(theirs: u64, ours: u64) -> Result<(), ProtocolViolation> {
    let skew = ours.abs_diff(theirs);
    if skew > burst::MAX_CLOCK_SKEW_SECS {
        return Err(ProtocolViolation::new(format!(
            "Your clocks are off by {skew} seconds. PLEASE SYNC YOUR CLOCKS"
        )));
    }
    if skew > burst::WARN_CLOCK_SKEW_SECS {
        tracing::warn!(skew, "clock skew detected on link; this can cause TS anomalies");
    }
    Ok(())
}

/// Handles an accepted inbound connection.
pub async fn run_inbound(state: Arc<SharedState>, stream: TcpStream, peer: SocketAddr) {
    let label = format!("inbound/{peer}");
    run_link(state, stream, label, None, peer.ip(), false, None).await;
}

/// Handles an accepted inbound connection on the TLS port.
pub async fn run_inbound_tls(
    state: Arc<SharedState>,
    hook: Arc<tls::TlsHook>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let label = format!("inbound-tls/{peer}");
    match hook.on_accept(stream).await {
        Ok((stream, fingerprint)) => {
            run_link(state, stream, label, None, peer.ip(), true, fingerprint).await;
        }
        Err(err) => {
            tracing::warn!(%peer, "inbound link TLS handshake failed: {err:#}");
        }
    }
}

/// Dials the named link block and runs the session to completion.
pub async fn connect_to(state: Arc<SharedState>, name: &str) -> Result<()> {
    let block = state
        .config
        .find_link(name)
        .cloned()
        .with_context(|| format!("no link block named {name}"))?;
    let ip = block
        .ipaddr
        .clone()
        .with_context(|| format!("link {name} has no address to connect to"))?;
    let port = block
        .port
        .with_context(|| format!("link {name} has no port to connect to"))?;
    // Hostnames are fine here; resolution happens off-thread in the
    // runtime's resolver.
    let addr: SocketAddr = tokio::net::lookup_host(format!("{ip}:{port}"))
        .await
        .with_context(|| format!("link {name}: resolving {ip}:{port}"))?
        .next()
        .with_context(|| format!("link {name}: {ip} resolved to no addresses"))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| {
        tracing::warn!(link = name, kind = LinkError::SocketCreate.as_str(), "{e}");
        e
    })?;
    if let Some(ref bind) = block.bind {
        let bind_addr: SocketAddr = format!("{bind}:0")
            .parse()
            .with_context(|| format!("link {name}: bad bind address {bind}"))?;
        socket.bind(bind_addr).map_err(|e| {
            tracing::warn!(link = name, kind = LinkError::Bind.as_str(), "{e}");
            e
        })?;
    }

    tracing::info!(link = name, %addr, "connecting");
    let stream = tokio::time::timeout(Duration::from_secs(block.timeout), socket.connect(addr))
        .await
        .map_err(|_| {
            tracing::warn!(link = name, kind = LinkError::Timeout.as_str(), "connect timed out");
            anyhow::anyhow!("connect to {name} timed out")
        })?
        .map_err(|e| {
            let kind = LinkError::from_io(&e);
            tracing::warn!(link = name, kind = kind.as_str(), "connect failed: {e}");
            e
        })?;

    let label = format!("outbound/{name}");
    if block.ssl.as_deref() == Some("rustls") {
        let hook = tls::TlsHook::from_config(&state.config)?;
        let (stream, fingerprint) = hook.on_connect(stream, name).await?;
        run_link(
            state,
            stream,
            label,
            Some(name.to_string()),
            addr.ip(),
            true,
            fingerprint,
        )
        .await;
    } else {
        run_link(state, stream, label, Some(name.to_string()), addr.ip(), false, None).await;
    }
    Ok(())
}

/// Runs the autoconnect schedule: every `period` seconds each block
/// checks whether any of its servers is linked and, if not, dials the
/// next candidate in the failover list.
pub fn spawn_autoconnect(state: Arc<SharedState>) {
    for (index, block) in state.config.network.autoconnect.iter().enumerate() {
        if block.period == 0 {
            tracing::warn!(index, "ignoring autoconnect block with period 0");
            continue;
        }
        let period = Duration::from_secs(block.period);
        let servers: Vec<String> = block.servers().map(str::to_string).collect();
        if servers.is_empty() {
            continue;
        }
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut position = 0usize;
            loop {
                tokio::time::sleep(period).await;
                let linked = {
                    let net = state.net.lock();
                    servers.iter().any(|s| net.tree.find_by_name(s).is_some())
                };
                if linked {
                    continue;
                }
                let target = servers[position % servers.len()].clone();
                position += 1;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = connect_to(state, &target).await {
                        tracing::warn!(link = %target, "autoconnect failed: {err:#}");
                    }
                });
            }
        });
    }
}

/// The shared session body for both directions and both transports.
async fn run_link<S>(
    state: Arc<SharedState>,
    stream: S,
    label: String,
    dialed: Option<String>,
    peer_ip: IpAddr,
    is_tls: bool,
    fingerprint: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<String>(4096);
    let handle = state.register_link(tx, label.clone());
    let link_id = handle.id;

    // Writer task: drain the send queue, batching writes between
    // flushes to keep syscall counts down.
    let write_label = label.clone();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::warn!(link = %write_label, kind = LinkError::from_io(&e).as_str(), "write error: {e}");
                return;
            }
            let mut batched = 0;
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = writer.write_all(queued.as_bytes()).await {
                    tracing::warn!(link = %write_label, kind = LinkError::from_io(&e).as_str(), "write error: {e}");
                    return;
                }
                batched += 1;
                if batched >= 64 {
                    break;
                }
            }
            if let Err(e) = writer.flush().await {
                tracing::warn!(link = %write_label, "flush error: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut session = LinkSession {
        state: Arc::clone(&state),
        handle: handle.clone(),
        link_state: if dialed.is_some() {
            LinkState::Connecting
        } else {
            LinkState::WaitAuth1
        },
        neg: Negotiation::new(),
        dialed,
        peer_ip,
        is_tls,
        fingerprint,
        peer: None,
        sent_capab: false,
        ping_phase: PingPhase::SendPing,
        last_ping_ms: 0,
        deadline: Instant::now(),
    };
    session.arm_deadline();

    // The initiator opens the capability exchange as soon as the
    // transport is writable.
    if session.dialed.is_some() {
        for line in capab::capab_block(&session.neg) {
            session.send(line);
        }
        session.sent_capab = true;
        session.link_state = LinkState::WaitAuth1;
    }

    let mut reader = reader;
    // Receive buffer; complete LF-terminated lines are peeled off the
    // front as they arrive.
    let mut recvq: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut close_reason: Option<String> = None;

    'session: loop {
        let read = tokio::select! {
            _ = handle.shutdown.notified() => {
                session.link_state = LinkState::Dying;
                break 'session;
            }
            _ = tokio::time::sleep_until(session.deadline) => {
                match session.on_phase_timeout() {
                    Ok(true) => continue 'session,
                    Ok(false) => break 'session,
                    Err(reason) => {
                        close_reason = Some(reason);
                        break 'session;
                    }
                }
            }
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                tracing::info!(link = %label, kind = LinkError::Disconnect.as_str(), "connection closed by peer");
                break 'session;
            }
            Ok(n) => recvq.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::warn!(link = %label, kind = LinkError::from_io(&e).as_str(), "read error: {e}");
                break 'session;
            }
        }

        while let Some(nl) = recvq.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = recvq.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&raw[..nl]);
            let trimmed = line.trim_end_matches('\r');
            let msg = match Message::parse(trimmed) {
                Ok(msg) => msg,
                Err(MessageError::Empty) => continue,
                Err(MessageError::NulByte) => {
                    close_reason = Some("NUL byte in line".to_string());
                    break 'session;
                }
                Err(err) => {
                    close_reason = Some(err.to_string());
                    break 'session;
                }
            };

            if session.link_state == LinkState::Connected {
                session.maybe_note_pong(&msg);
                if msg.command == "ERROR" {
                    tracing::warn!(
                        link = %label,
                        error = %msg.params.first().map(String::as_str).unwrap_or(""),
                        "peer closed the link with an error"
                    );
                    break 'session;
                }
                if let Err(violation) = crate::commands::dispatch(&state, link_id, msg) {
                    close_reason = Some(violation.to_string());
                    break 'session;
                }
            } else {
                match session.on_handshake_line(&msg) {
                    Ok(true) => {}
                    Ok(false) => break 'session,
                    Err(violation) => {
                        close_reason = Some(violation.to_string());
                        break 'session;
                    }
                }
            }
        }
        if recvq.len() > MAX_TAG_LENGTH + MAX_LINE_LENGTH {
            close_reason = Some("Line exceeds the protocol limit".to_string());
            break 'session;
        }
    }

    // DYING: the error (if any) is the last line out, then the writer
    // drains and the subtree splits.
    if let Some(reason) = close_reason.as_deref() {
        state.send_error_and_close(link_id, reason);
    }
    state.unregister_link(link_id);
    {
        let mut net = state.net.lock();
        netsplit::on_link_lost(
            &state,
            &mut net,
            link_id,
            close_reason.as_deref().unwrap_or("Connection closed"),
        );
    }
    // Every sender clone must go before the writer can finish
    // draining.
    drop(session);
    drop(handle);
    let _ = writer_task.await;
    tracing::info!(link = %label, "link task finished");
}
