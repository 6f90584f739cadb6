//! Socket-owning session loops.
//!
//! Each endpoint runs one task that owns its `UdpSocket`, alternating
//! between received datagrams, session timers, and outbound packets, with
//! shutdown signalled over a watch channel. The public surface is a pair
//! of packet channels plus a session event stream; the task itself stays
//! private.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use midi2_core::ump::UmpPacket;

use crate::command::{decode_datagram, encode_datagram, ByeReason, Command};
use crate::session::{Session, SessionConfig, SessionEvent, SessionRole, SessionState};

/// Largest datagram the loops will read. The transport must carry at
/// least 1280 payload bytes; reading double that keeps headroom.
const MAX_DATAGRAM: usize = 2560;

const EVENT_CHANNEL: usize = 64;

/// Handle to a running UDP endpoint task.
///
/// `send` queues packets for the peer (bounded by the session's
/// outstanding window, which is where back-pressure comes from); `recv`
/// yields packets the transport released in order.
pub struct UdpEndpoint {
    tx: mpsc::Sender<UmpPacket>,
    rx: mpsc::Receiver<UmpPacket>,
    events: mpsc::Receiver<SessionEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    pub async fn send(&self, packet: UmpPacket) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("endpoint task is gone"))
    }

    pub fn sender(&self) -> mpsc::Sender<UmpPacket> {
        self.tx.clone()
    }

    pub async fn recv(&mut self) -> Option<UmpPacket> {
        self.rx.recv().await
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the task to run an orderly Bye exchange and waits for it.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("endpoint task panicked")
    }
}

struct LoopChannels {
    packets_out: mpsc::Sender<UmpPacket>,
    events_out: mpsc::Sender<SessionEvent>,
}

async fn dispatch(
    socket: &UdpSocket,
    peer: Option<SocketAddr>,
    channels: &LoopChannels,
    output: crate::session::SessionOutput,
) -> Result<bool> {
    let mut closed = false;
    if !output.commands.is_empty() {
        let datagram = encode_datagram(&output.commands)?;
        match peer {
            Some(addr) => {
                socket.send_to(&datagram, addr).await?;
            }
            None => {
                socket.send(&datagram).await?;
            }
        }
    }
    for packet in output.packets {
        if channels.packets_out.send(packet).await.is_err() {
            closed = true;
        }
    }
    for event in output.events {
        if matches!(event, SessionEvent::Closed { .. }) {
            closed = true;
        }
        // Nobody listening is fine; events are advisory.
        let _ = channels.events_out.try_send(event);
    }
    Ok(closed)
}

/// Connects to `peer`, runs the handshake, and returns once the session
/// is established (or fails with the rejection).
pub async fn connect(peer: SocketAddr, config: SessionConfig) -> Result<UdpEndpoint> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding client socket")?;
    socket.connect(peer).await.context("connecting UDP socket")?;
    let mut endpoint = spawn_client(socket, config)?;

    match endpoint.next_event().await {
        Some(SessionEvent::Established { remote_ucmep, remote_name }) => {
            info!("connected to '{remote_name}' (ucmep {remote_ucmep:#010x}) at {peer}");
            Ok(endpoint)
        }
        Some(SessionEvent::Rejected { reason }) => {
            let _ = endpoint.shutdown().await;
            bail!("invitation rejected: {reason:?}")
        }
        Some(SessionEvent::Closed { reason }) => {
            let _ = endpoint.shutdown().await;
            bail!("session closed during handshake: {reason:?}")
        }
        other => {
            let _ = endpoint.shutdown().await;
            bail!("handshake did not complete: {other:?}")
        }
    }
}

fn spawn_client(socket: UdpSocket, config: SessionConfig) -> Result<UdpEndpoint> {
    let local_addr = socket.local_addr().context("reading local address")?;
    let window = config.outstanding_window;
    let (tx, mut packet_rx) = mpsc::channel::<UmpPacket>(window);
    let (packets_out, rx) = mpsc::channel::<UmpPacket>(window);
    let (events_out, events) = mpsc::channel::<SessionEvent>(EVENT_CHANNEL);
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let channels = LoopChannels { packets_out, events_out };
        let mut session = Session::new(SessionRole::Client, config, Instant::now());
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let hello = session.start(Instant::now());
        if let Err(err) = dispatch(&socket, None, &channels, hello).await {
            error!("client endpoint failed to start: {err}");
            return;
        }

        loop {
            let deadline = session.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let output = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let out = session.close(ByeReason::Shutdown, Instant::now());
                        let _ = dispatch(&socket, None, &channels, out).await;
                        if session.state() != SessionState::Closing {
                            break;
                        }
                        // Otherwise stay for the Bye Reply or the grace
                        // timer, whichever ends the session first.
                    }
                    continue;
                }
                received = socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(err) => {
                            error!("udp receive failed: {err}");
                            break;
                        }
                    };
                    match decode_datagram(&buf[..len]) {
                        Ok(commands) => session.handle_datagram(commands, Instant::now()),
                        Err(err) => {
                            warn!("dropping undecodable datagram: {err}");
                            continue;
                        }
                    }
                }
                maybe = packet_rx.recv(), if session.state() == SessionState::Established => {
                    match maybe {
                        Some(packet) => {
                            match session.send_ump(&[packet], Instant::now()) {
                                Ok(out) => out,
                                Err(err) => {
                                    warn!("cannot send: {err}");
                                    continue;
                                }
                            }
                        }
                        None => {
                            let out = session.close(ByeReason::Shutdown, Instant::now());
                            let _ = dispatch(&socket, None, &channels, out).await;
                            if session.state() != SessionState::Closing {
                                break;
                            }
                            continue;
                        }
                    }
                }
                _ = timer => session.poll(Instant::now()),
            };
            match dispatch(&socket, None, &channels, output).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    error!("client endpoint i/o failed: {err}");
                    break;
                }
            }
        }
        debug!("client endpoint loop finished");
    });

    Ok(UdpEndpoint { tx, rx, events, shutdown, task, local_addr })
}

/// Binds `addr` and serves sessions for any number of peers. Outbound
/// packets go to every established session; inbound packets from all
/// sessions are merged into one stream (ordering holds per session only).
pub async fn serve(addr: SocketAddr, config: SessionConfig) -> Result<UdpEndpoint> {
    let socket = UdpSocket::bind(addr).await.context("binding server socket")?;
    let local_addr = socket.local_addr().context("reading local address")?;
    info!("network midi server listening on {local_addr}");

    let window = config.outstanding_window;
    let (tx, mut packet_rx) = mpsc::channel::<UmpPacket>(window);
    let (packets_out, rx) = mpsc::channel::<UmpPacket>(window);
    let (events_out, events) = mpsc::channel::<SessionEvent>(EVENT_CHANNEL);
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let channels = LoopChannels { packets_out, events_out };
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut draining = false;

        loop {
            let deadline = sessions.values().filter_map(Session::next_deadline).min();
            let timer = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        draining = true;
                        let now = Instant::now();
                        for (peer, session) in sessions.iter_mut() {
                            let out = session.close(ByeReason::Shutdown, now);
                            if let Err(err) = dispatch(&socket, Some(*peer), &channels, out).await {
                                warn!("bye to {peer} failed: {err}");
                            }
                        }
                        sessions.retain(|_, s| s.state() != SessionState::Idle);
                        if sessions.is_empty() {
                            break;
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!("udp receive failed: {err}");
                            break;
                        }
                    };
                    let commands = match decode_datagram(&buf[..len]) {
                        Ok(commands) => commands,
                        Err(err) => {
                            warn!("dropping undecodable datagram from {peer}: {err}");
                            continue;
                        }
                    };
                    if !sessions.contains_key(&peer) {
                        if draining || !commands.iter().any(|c| matches!(c, Command::Invitation { .. })) {
                            debug!("ignoring datagram from unknown peer {peer}");
                            continue;
                        }
                        info!("new session from {peer}");
                        sessions.insert(
                            peer,
                            Session::new(SessionRole::Server, config.clone(), Instant::now()),
                        );
                    }
                    let output = sessions
                        .get_mut(&peer)
                        .map(|session| session.handle_datagram(commands, Instant::now()));
                    if let Some(output) = output {
                        if let Err(err) = dispatch(&socket, Some(peer), &channels, output).await {
                            error!("server endpoint i/o failed: {err}");
                            break;
                        }
                    }
                    sessions.retain(|_, s| s.state() != SessionState::Idle);
                    if draining && sessions.is_empty() {
                        break;
                    }
                }
                maybe = packet_rx.recv(), if !draining => {
                    let Some(packet) = maybe else {
                        draining = true;
                        let now = Instant::now();
                        for (peer, session) in sessions.iter_mut() {
                            let out = session.close(ByeReason::Shutdown, now);
                            let _ = dispatch(&socket, Some(*peer), &channels, out).await;
                        }
                        sessions.retain(|_, s| s.state() != SessionState::Idle);
                        if sessions.is_empty() {
                            break;
                        }
                        continue;
                    };
                    let now = Instant::now();
                    let peers: Vec<SocketAddr> = sessions
                        .iter()
                        .filter(|(_, s)| s.state() == SessionState::Established)
                        .map(|(peer, _)| *peer)
                        .collect();
                    for peer in peers {
                        let output = sessions
                            .get_mut(&peer)
                            .and_then(|s| s.send_ump(std::slice::from_ref(&packet), now).ok());
                        if let Some(output) = output {
                            if let Err(err) = dispatch(&socket, Some(peer), &channels, output).await {
                                warn!("send to {peer} failed: {err}");
                            }
                        }
                    }
                }
                _ = timer => {
                    let now = Instant::now();
                    let peers: Vec<SocketAddr> = sessions.keys().copied().collect();
                    for peer in peers {
                        let output = sessions.get_mut(&peer).map(|s| s.poll(now));
                        if let Some(output) = output {
                            if let Err(err) = dispatch(&socket, Some(peer), &channels, output).await {
                                warn!("timer send to {peer} failed: {err}");
                            }
                        }
                    }
                    sessions.retain(|_, s| s.state() != SessionState::Idle);
                    if draining && sessions.is_empty() {
                        break;
                    }
                }
            }
        }
        debug!("server endpoint loop finished");
    });

    Ok(UdpEndpoint { tx, rx, events, shutdown, task, local_addr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi2_core::ump::Midi1ChannelVoice;

    fn note(n: u8) -> UmpPacket {
        UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, n, 100))
    }

    #[tokio::test]
    async fn loopback_handshake_and_data() {
        let mut server = serve(
            "127.0.0.1:0".parse().unwrap(),
            SessionConfig { endpoint_name: "server".into(), ..Default::default() },
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        let client = connect(
            addr,
            SessionConfig { endpoint_name: "client".into(), ..Default::default() },
        )
        .await
        .unwrap();

        for n in 0..5u8 {
            client.send(note(n)).await.unwrap();
        }
        for n in 0..5u8 {
            assert_eq!(server.recv().await, Some(note(n)));
        }

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn loopback_with_shared_secret() {
        let auth = crate::auth::AuthMethod::SharedSecret("s3cret".into());
        let mut server = serve(
            "127.0.0.1:0".parse().unwrap(),
            SessionConfig {
                endpoint_name: "server".into(),
                auth: Some(auth.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        let client = connect(
            addr,
            SessionConfig { endpoint_name: "client".into(), auth: Some(auth), ..Default::default() },
        )
        .await
        .unwrap();

        client.send(note(7)).await.unwrap();
        assert_eq!(server.recv().await, Some(note(7)));
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wrong_secret_fails_connect() {
        let server = serve(
            "127.0.0.1:0".parse().unwrap(),
            SessionConfig {
                endpoint_name: "server".into(),
                auth: Some(crate::auth::AuthMethod::SharedSecret("right".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        let result = connect(
            addr,
            SessionConfig {
                endpoint_name: "client".into(),
                auth: Some(crate::auth::AuthMethod::SharedSecret("wrong".into())),
                ..Default::default()
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn server_to_client_data_flows() {
        let server = serve(
            "127.0.0.1:0".parse().unwrap(),
            SessionConfig { endpoint_name: "server".into(), ..Default::default() },
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        let mut client = connect(
            addr,
            SessionConfig { endpoint_name: "client".into(), ..Default::default() },
        )
        .await
        .unwrap();

        server.send(note(42)).await.unwrap();
        assert_eq!(client.recv().await, Some(note(42)));
        client.shutdown().await.unwrap();
    }
}
