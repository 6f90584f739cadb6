//! The Network MIDI 2.0 session state machine.
//!
//! A `Session` is pure protocol state: commands go in, commands and
//! decoded UMP packets come out, and the socket-owning loop in
//! [`crate::endpoint`] does the actual I/O. Timers are expressed as
//! deadlines the loop sleeps on and feeds back through [`Session::poll`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use midi2_core::ump::{decode_all, encode_packet, UmpPacket};

use crate::auth::{self, AuthMethod};
use crate::command::{code, ByeReason, Command, NakReason, NONCE_LEN, RETRANSMIT_REASON_EVICTED};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Lifecycle of a session.
///
/// `Authenticating` is the challenge-issued state: the peer has been sent
/// a nonce and this session waits for its Authorization Reply. The client
/// side computes and sends its reply within the same dispatch, so between
/// calls a challenged client is observable as `PendingInvite` again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PendingInvite,
    Authenticating,
    Established,
    Closing,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub endpoint_name: String,
    /// Client: credentials presented when challenged. Server: credentials
    /// peers must prove they hold.
    pub auth: Option<AuthMethod>,
    /// Sent UMP Data commands kept for retransmission. At least 64.
    pub outstanding_window: usize,
    /// Previously sent UMP Data commands piggybacked on each new datagram.
    pub fec_depth: usize,
    pub idle_timeout: Duration,
    pub ping_timeout: Duration,
    pub ping_retries: u32,
    pub invite_timeout: Duration,
    pub invite_retries: u32,
    pub bye_grace: Duration,
    pub retransmit_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            endpoint_name: String::new(),
            auth: None,
            outstanding_window: 128,
            fec_depth: 2,
            idle_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            ping_retries: 3,
            invite_timeout: Duration::from_secs(2),
            invite_retries: 10,
            bye_grace: Duration::from_millis(200),
            retransmit_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Established { remote_ucmep: u32, remote_name: String },
    /// The peer rejected our invitation or authorization.
    Rejected { reason: NakReason },
    /// A peer failed to authenticate against this session.
    AuthFailed,
    Closed { reason: ByeReason },
    /// A codec-level problem with one packet; the session keeps running.
    Diagnostic(String),
}

/// What a dispatch produced: commands to put on the wire (one datagram),
/// packets released in order to the consumer, and lifecycle events.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub commands: Vec<Command>,
    pub packets: Vec<UmpPacket>,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug)]
pub enum SessionError {
    NotEstablished,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotEstablished => write!(f, "session is not established"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Clone, Debug)]
struct SentData {
    sequence: u16,
    words: Vec<u32>,
}

#[derive(Copy, Clone, Debug)]
struct PingState {
    id: u32,
    sent_at: Instant,
    attempts: u32,
}

/// `seq - base` in wrapping space; values >= 0x8000 mean "behind base".
fn seq_ahead(seq: u16, base: u16) -> u16 {
    seq.wrapping_sub(base)
}

pub struct Session {
    role: SessionRole,
    config: SessionConfig,
    state: SessionState,
    local_ucmep: u32,
    remote_ucmep: Option<u32>,
    remote_name: String,

    tx_sequence: u16,
    outstanding: VecDeque<SentData>,

    rx_next: u16,
    pending_rx: BTreeMap<u16, Vec<u32>>,

    nonce: Option<[u8; NONCE_LEN]>,

    last_rx_at: Instant,
    ping: Option<PingState>,

    invite_deadline: Option<Instant>,
    invite_attempts: u32,
    grace_deadline: Option<Instant>,
    retransmit_deadline: Option<Instant>,
    closing_reason: ByeReason,
}

impl Session {
    pub fn new(role: SessionRole, config: SessionConfig, now: Instant) -> Self {
        Self::with_ucmep(role, config, rand::random(), now)
    }

    /// Like [`Session::new`] with a caller-chosen UCMEP id; useful when the
    /// id must be stable or, in tests, deterministic.
    pub fn with_ucmep(role: SessionRole, config: SessionConfig, ucmep: u32, now: Instant) -> Self {
        Session {
            role,
            config,
            state: SessionState::Idle,
            local_ucmep: ucmep,
            remote_ucmep: None,
            remote_name: String::new(),
            tx_sequence: 0,
            outstanding: VecDeque::new(),
            rx_next: 0,
            pending_rx: BTreeMap::new(),
            nonce: None,
            last_rx_at: now,
            ping: None,
            invite_deadline: None,
            invite_attempts: 0,
            grace_deadline: None,
            retransmit_deadline: None,
            closing_reason: ByeReason::Shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn local_ucmep(&self) -> u32 {
        self.local_ucmep
    }

    pub fn remote_ucmep(&self) -> Option<u32> {
        self.remote_ucmep
    }

    fn invitation(&self) -> Command {
        let capabilities = self.config.auth.as_ref().map_or(0, AuthMethod::capability);
        Command::Invitation {
            capabilities,
            ucmep: self.local_ucmep,
            name: self.config.endpoint_name.clone(),
        }
    }

    /// Client: kick off the handshake.
    pub fn start(&mut self, now: Instant) -> SessionOutput {
        let mut out = SessionOutput::default();
        if self.role != SessionRole::Client || self.state != SessionState::Idle {
            return out;
        }
        self.state = SessionState::PendingInvite;
        self.invite_attempts = 1;
        self.invite_deadline = Some(now + self.config.invite_timeout);
        out.commands.push(self.invitation());
        out
    }

    /// Begins an orderly teardown with a Bye / Bye Reply exchange.
    pub fn close(&mut self, reason: ByeReason, now: Instant) -> SessionOutput {
        let mut out = SessionOutput::default();
        if matches!(self.state, SessionState::Idle | SessionState::Closing) {
            return out;
        }
        self.state = SessionState::Closing;
        self.closing_reason = reason;
        self.grace_deadline = Some(now + self.config.bye_grace);
        self.invite_deadline = None;
        out.commands.push(Command::Bye { reason });
        out
    }

    /// Resets outbound sequence state and asks the peer to do the same.
    pub fn reset(&mut self) -> SessionOutput {
        let mut out = SessionOutput::default();
        self.tx_sequence = 0;
        self.outstanding.clear();
        out.commands.push(Command::SessionReset);
        out
    }

    /// Queues `packets` as one sequence-numbered UMP Data command, with up
    /// to `fec_depth` earlier commands piggybacked for loss recovery.
    pub fn send_ump(
        &mut self,
        packets: &[UmpPacket],
        _now: Instant,
    ) -> Result<SessionOutput, SessionError> {
        if self.state != SessionState::Established {
            return Err(SessionError::NotEstablished);
        }
        let mut out = SessionOutput::default();
        let mut words = Vec::new();
        for packet in packets {
            encode_packet(packet, &mut words);
        }
        let sequence = self.tx_sequence;
        self.tx_sequence = self.tx_sequence.wrapping_add(1);

        let fec_from = self.outstanding.len().saturating_sub(self.config.fec_depth);
        for earlier in self.outstanding.iter().skip(fec_from) {
            out.commands.push(Command::UmpData {
                sequence: earlier.sequence,
                words: earlier.words.clone(),
            });
        }
        out.commands.push(Command::UmpData { sequence, words: words.clone() });

        self.outstanding.push_back(SentData { sequence, words });
        while self.outstanding.len() > self.config.outstanding_window {
            self.outstanding.pop_front();
        }
        Ok(out)
    }

    /// Dispatches every command of a received datagram.
    pub fn handle_datagram(&mut self, commands: Vec<Command>, now: Instant) -> SessionOutput {
        self.last_rx_at = now;
        self.ping = None;
        let mut out = SessionOutput::default();
        for command in commands {
            self.handle_command(command, now, &mut out);
        }
        out
    }

    fn handle_command(&mut self, command: Command, now: Instant, out: &mut SessionOutput) {
        match command {
            Command::Ping { id } => out.commands.push(Command::PingReply { id }),
            Command::PingReply { id } => {
                debug!("ping {id:#010x} answered");
            }
            Command::UmpData { sequence, words } => self.on_ump_data(sequence, words, now, out),
            Command::RetransmitRequest { first, count } => {
                self.on_retransmit_request(first, count, out)
            }
            Command::RetransmitError { reason, first } => {
                self.on_retransmit_error(reason, first, out)
            }
            Command::SessionReset => {
                info!("peer reset the session sequence state");
                self.rx_next = 0;
                self.pending_rx.clear();
                self.retransmit_deadline = None;
                out.commands.push(Command::SessionResetReply);
            }
            Command::SessionResetReply => debug!("session reset acknowledged"),
            Command::Bye { reason } => {
                out.commands.push(Command::ByeReply);
                self.teardown();
                out.events.push(SessionEvent::Closed { reason });
            }
            Command::ByeReply => {
                if self.state == SessionState::Closing {
                    let reason = self.closing_reason;
                    self.teardown();
                    out.events.push(SessionEvent::Closed { reason });
                }
            }
            Command::Invitation { capabilities, ucmep, name } => {
                self.on_invitation(capabilities, ucmep, name, out)
            }
            Command::InvitationAccepted { ucmep, name } => {
                if self.state == SessionState::PendingInvite {
                    self.remote_ucmep = Some(ucmep);
                    self.remote_name = name.clone();
                    self.invite_deadline = None;
                    self.state = SessionState::Established;
                    info!("session established with '{name}' (ucmep {ucmep:#010x})");
                    out.events.push(SessionEvent::Established { remote_ucmep: ucmep, remote_name: name });
                } else if self.state != SessionState::Established {
                    self.nak(code::INVITATION_ACCEPTED, out);
                }
            }
            Command::InvitationPending => {
                if self.state == SessionState::PendingInvite {
                    info!("peer holds our invitation pending");
                    self.invite_deadline = None;
                }
            }
            Command::InvitationWithAuth { nonce } => {
                self.on_challenge(nonce, false, now, out);
            }
            Command::InvitationWithUserAuth { nonce } => {
                self.on_challenge(nonce, true, now, out);
            }
            Command::AuthorizationReply { method, digest, username } => {
                self.on_authorization_reply(method, digest, username, out)
            }
            Command::Nak { reason, command } => {
                warn!("peer nak'd command {command:#04x}: {reason:?}");
                if matches!(self.state, SessionState::PendingInvite | SessionState::Authenticating) {
                    self.teardown();
                    out.events.push(SessionEvent::Rejected { reason });
                }
            }
            Command::Unknown { code, .. } => {
                debug!("ignoring unknown command {code:#04x}");
            }
        }
    }

    fn nak(&self, failed_command: u8, out: &mut SessionOutput) {
        out.commands.push(Command::Nak {
            reason: NakReason::ProtocolViolation,
            command: failed_command,
        });
    }

    fn teardown(&mut self) {
        self.state = SessionState::Idle;
        self.invite_deadline = None;
        self.grace_deadline = None;
        self.retransmit_deadline = None;
        self.ping = None;
        self.nonce = None;
    }

    fn accept(&mut self, out: &mut SessionOutput) {
        self.state = SessionState::Established;
        out.commands.push(Command::InvitationAccepted {
            ucmep: self.local_ucmep,
            name: self.config.endpoint_name.clone(),
        });
        let remote_ucmep = self.remote_ucmep.unwrap_or(0);
        info!(
            "session established with '{}' (ucmep {remote_ucmep:#010x})",
            self.remote_name
        );
        out.events.push(SessionEvent::Established {
            remote_ucmep,
            remote_name: self.remote_name.clone(),
        });
    }

    fn on_invitation(&mut self, _capabilities: u32, ucmep: u32, name: String, out: &mut SessionOutput) {
        match self.state {
            SessionState::Idle => {
                self.remote_ucmep = Some(ucmep);
                self.remote_name = name;
                match self.config.auth.clone() {
                    Some(method) => {
                        let nonce = auth::generate_nonce();
                        self.nonce = Some(nonce);
                        self.state = SessionState::Authenticating;
                        out.commands.push(method.challenge(nonce));
                    }
                    None => self.accept(out),
                }
            }
            SessionState::Authenticating => {
                // Retried invitation: repeat the standing challenge.
                if let (Some(method), Some(nonce)) = (self.config.auth.as_ref(), self.nonce) {
                    out.commands.push(method.challenge(nonce));
                }
            }
            SessionState::Established => {
                // Our acceptance was lost; acknowledging again is harmless.
                out.commands.push(Command::InvitationAccepted {
                    ucmep: self.local_ucmep,
                    name: self.config.endpoint_name.clone(),
                });
            }
            SessionState::PendingInvite => {
                // Glare: both sides invited at once. Lowest UCMEP wins; the
                // loser abandons its own invitation and answers the peer's.
                if ucmep < self.local_ucmep {
                    info!("invitation glare, yielding to lower ucmep {ucmep:#010x}");
                    self.invite_deadline = None;
                    self.remote_ucmep = Some(ucmep);
                    self.remote_name = name;
                    match self.config.auth.clone() {
                        Some(method) => {
                            let nonce = auth::generate_nonce();
                            self.nonce = Some(nonce);
                            self.state = SessionState::Authenticating;
                            out.commands.push(method.challenge(nonce));
                        }
                        None => self.accept(out),
                    }
                } else {
                    debug!("invitation glare, peer {ucmep:#010x} should yield");
                }
            }
            SessionState::Closing => {}
        }
    }

    fn on_challenge(&mut self, nonce: [u8; NONCE_LEN], user_auth: bool, now: Instant, out: &mut SessionOutput) {
        if self.state != SessionState::PendingInvite {
            self.nak(
                if user_auth { code::INVITATION_USER_AUTH } else { code::INVITATION_AUTH },
                out,
            );
            return;
        }
        let usable = match (&self.config.auth, user_auth) {
            (Some(AuthMethod::SharedSecret(_)), false) => true,
            (Some(AuthMethod::UserPassword { .. }), true) => true,
            _ => false,
        };
        if !usable {
            warn!("peer demands credentials this session does not hold");
            out.events.push(SessionEvent::AuthFailed);
            let close = self.close(ByeReason::AuthFailed, now);
            out.commands.extend(close.commands);
            return;
        }
        // Conceptually Authenticating; the reply goes out in this same
        // dispatch, returning the session to PendingInvite.
        let method = self.config.auth.clone().unwrap_or(AuthMethod::SharedSecret(String::new()));
        out.commands.push(method.reply(&nonce));
        self.invite_deadline = Some(now + self.config.invite_timeout);
    }

    fn on_authorization_reply(
        &mut self,
        method: u8,
        digest: [u8; 32],
        username: String,
        out: &mut SessionOutput,
    ) {
        if self.state != SessionState::Authenticating {
            self.nak(code::AUTHORIZATION_REPLY, out);
            return;
        }
        let verified = match (self.config.auth.as_ref(), self.nonce.as_ref()) {
            (Some(required), Some(nonce)) => required.verify(nonce, method, &digest, &username),
            _ => false,
        };
        if verified {
            self.nonce = None;
            self.accept(out);
        } else {
            warn!("authorization failed for '{username}'");
            out.commands.push(Command::Nak {
                reason: NakReason::AuthFailed,
                command: code::AUTHORIZATION_REPLY,
            });
            out.events.push(SessionEvent::AuthFailed);
            self.teardown();
        }
    }

    fn deliver(&mut self, words: &[u32], out: &mut SessionOutput) {
        match decode_all(words) {
            Ok(packets) => out.packets.extend(packets),
            Err(err) => {
                warn!("dropping undecodable ump data: {err}");
                out.events.push(SessionEvent::Diagnostic(err.to_string()));
            }
        }
    }

    fn on_ump_data(&mut self, sequence: u16, words: Vec<u32>, now: Instant, out: &mut SessionOutput) {
        if self.state != SessionState::Established {
            self.nak(code::UMP_DATA, out);
            return;
        }
        let ahead = seq_ahead(sequence, self.rx_next);
        if ahead >= 0x8000 {
            debug!("duplicate ump data seq {sequence}");
            return;
        }
        if ahead == 0 {
            self.deliver(&words, out);
            self.rx_next = self.rx_next.wrapping_add(1);
            while let Some(buffered) = self.pending_rx.remove(&self.rx_next) {
                self.deliver(&buffered, out);
                self.rx_next = self.rx_next.wrapping_add(1);
            }
            if self.pending_rx.is_empty() {
                self.retransmit_deadline = None;
            }
            return;
        }
        // Gap: hold this command and chase the missing span.
        if self.pending_rx.insert(sequence, words).is_none() {
            debug!(
                "buffered out-of-order seq {sequence}, missing from {}",
                self.rx_next
            );
        }
        out.commands.push(Command::RetransmitRequest { first: self.rx_next, count: ahead });
        self.retransmit_deadline = Some(now + self.config.retransmit_interval);
    }

    fn on_retransmit_request(&mut self, first: u16, count: u16, out: &mut SessionOutput) {
        // The request's `first` doubles as an implicit ack of everything
        // before it; those entries can leave the window.
        while let Some(front) = self.outstanding.front() {
            let behind = seq_ahead(first, front.sequence);
            if behind != 0 && behind < 0x8000 {
                self.outstanding.pop_front();
            } else {
                break;
            }
        }
        for offset in 0..count {
            let sequence = first.wrapping_add(offset);
            match self.outstanding.iter().find(|e| e.sequence == sequence) {
                Some(entry) => out.commands.push(Command::UmpData {
                    sequence: entry.sequence,
                    words: entry.words.clone(),
                }),
                None => {
                    warn!("seq {sequence} evicted before retransmit request");
                    out.commands.push(Command::RetransmitError {
                        reason: RETRANSMIT_REASON_EVICTED,
                        first: sequence,
                    });
                    break;
                }
            }
        }
    }

    fn on_retransmit_error(&mut self, reason: u16, first: u16, out: &mut SessionOutput) {
        warn!("peer cannot retransmit from seq {first} (reason {reason})");
        out.events.push(SessionEvent::Diagnostic(format!(
            "retransmit unavailable from seq {first}"
        )));
        // Skip the unrecoverable span so delivery does not deadlock.
        let Some(&nearest) = self
            .pending_rx
            .keys()
            .min_by_key(|&&seq| seq_ahead(seq, self.rx_next))
        else {
            self.retransmit_deadline = None;
            return;
        };
        self.rx_next = nearest;
        while let Some(buffered) = self.pending_rx.remove(&self.rx_next) {
            self.deliver(&buffered, out);
            self.rx_next = self.rx_next.wrapping_add(1);
        }
        if self.pending_rx.is_empty() {
            self.retransmit_deadline = None;
        }
    }

    /// Runs every timer that has expired at `now`.
    pub fn poll(&mut self, now: Instant) -> SessionOutput {
        let mut out = SessionOutput::default();

        if let Some(deadline) = self.invite_deadline {
            if now >= deadline && self.state == SessionState::PendingInvite {
                if self.invite_attempts < self.config.invite_retries {
                    self.invite_attempts += 1;
                    self.invite_deadline = Some(now + self.config.invite_timeout);
                    debug!("re-sending invitation, attempt {}", self.invite_attempts);
                    out.commands.push(self.invitation());
                } else {
                    warn!("invitation timed out after {} attempts", self.invite_attempts);
                    self.teardown();
                    out.events.push(SessionEvent::Closed { reason: ByeReason::Timeout });
                }
            }
        }

        if self.state == SessionState::Established {
            match self.ping {
                Some(ping) if now >= ping.sent_at + self.config.ping_timeout => {
                    if ping.attempts >= self.config.ping_retries {
                        warn!("peer silent through {} pings, closing", ping.attempts);
                        let close = self.close(ByeReason::Timeout, now);
                        out.commands.extend(close.commands);
                    } else {
                        let id = rand::random();
                        self.ping = Some(PingState { id, sent_at: now, attempts: ping.attempts + 1 });
                        out.commands.push(Command::Ping { id });
                    }
                }
                None if now >= self.last_rx_at + self.config.idle_timeout => {
                    let id = rand::random();
                    self.ping = Some(PingState { id, sent_at: now, attempts: 1 });
                    out.commands.push(Command::Ping { id });
                }
                _ => {}
            }
        }

        if let Some(deadline) = self.grace_deadline {
            if now >= deadline && self.state == SessionState::Closing {
                let reason = self.closing_reason;
                self.teardown();
                out.events.push(SessionEvent::Closed { reason });
            }
        }

        if let Some(deadline) = self.retransmit_deadline {
            if now >= deadline && !self.pending_rx.is_empty() {
                let span = self
                    .pending_rx
                    .keys()
                    .map(|&seq| seq_ahead(seq, self.rx_next))
                    .max()
                    .unwrap_or(0);
                out.commands.push(Command::RetransmitRequest { first: self.rx_next, count: span });
                self.retransmit_deadline = Some(now + self.config.retransmit_interval);
            }
        }

        out
    }

    /// The next instant `poll` should run, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |candidate: Option<Instant>| {
            if let Some(instant) = candidate {
                next = Some(next.map_or(instant, |n| n.min(instant)));
            }
        };
        consider(self.invite_deadline);
        consider(self.grace_deadline);
        consider(self.retransmit_deadline);
        if self.state == SessionState::Established {
            match self.ping {
                Some(ping) => consider(Some(ping.sent_at + self.config.ping_timeout)),
                None => consider(Some(self.last_rx_at + self.config.idle_timeout)),
            }
        }
        next
    }
}
