//! Wire codec for Network MIDI 2.0 UDP datagrams.
//!
//! A datagram is the ASCII magic `MIDI` followed by commands. Each command
//! is a three-byte header `<code><specific><length-in-words>` and
//! `4 * length` payload bytes; integers are big-endian throughout.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

pub mod code {
    pub const INVITATION: u8 = 0x01;
    pub const INVITATION_AUTH: u8 = 0x02;
    pub const INVITATION_USER_AUTH: u8 = 0x03;
    pub const INVITATION_ACCEPTED: u8 = 0x04;
    pub const INVITATION_PENDING: u8 = 0x05;
    pub const AUTHORIZATION_REPLY: u8 = 0x06;
    pub const PING: u8 = 0x20;
    pub const PING_REPLY: u8 = 0x21;
    pub const RETRANSMIT_REQUEST: u8 = 0x80;
    pub const RETRANSMIT_ERROR: u8 = 0x81;
    pub const SESSION_RESET: u8 = 0x82;
    pub const SESSION_RESET_REPLY: u8 = 0x83;
    pub const NAK: u8 = 0x84;
    pub const BYE: u8 = 0x85;
    pub const BYE_REPLY: u8 = 0x86;
    pub const UMP_DATA: u8 = 0xFF;
}

/// Capability bits advertised in an Invitation.
pub const CAP_AUTH_SHARED: u32 = 0x1;
pub const CAP_AUTH_USER: u32 = 0x2;

pub const MAGIC: [u8; 4] = *b"MIDI";
pub const NONCE_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

/// Reason byte carried by a Nak.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NakReason {
    ProtocolViolation,
    AuthFailed,
    Busy,
    Other(u8),
}

impl NakReason {
    pub fn to_byte(self) -> u8 {
        match self {
            NakReason::ProtocolViolation => 0x01,
            NakReason::AuthFailed => 0x02,
            NakReason::Busy => 0x03,
            NakReason::Other(byte) => byte,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => NakReason::ProtocolViolation,
            0x02 => NakReason::AuthFailed,
            0x03 => NakReason::Busy,
            other => NakReason::Other(other),
        }
    }
}

/// Reason byte carried in the `specific` slot of a Bye.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByeReason {
    Shutdown,
    Timeout,
    AuthFailed,
    ProtocolViolation,
    Other(u8),
}

impl ByeReason {
    pub fn to_byte(self) -> u8 {
        match self {
            ByeReason::Shutdown => 0x01,
            ByeReason::Timeout => 0x02,
            ByeReason::AuthFailed => 0x03,
            ByeReason::ProtocolViolation => 0x04,
            ByeReason::Other(byte) => byte,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => ByeReason::Shutdown,
            0x02 => ByeReason::Timeout,
            0x03 => ByeReason::AuthFailed,
            0x04 => ByeReason::ProtocolViolation,
            other => ByeReason::Other(other),
        }
    }
}

/// Reason half-word of a Retransmit Error.
pub const RETRANSMIT_REASON_EVICTED: u16 = 0x01;

/// One command inside a datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Invitation { capabilities: u32, ucmep: u32, name: String },
    InvitationWithAuth { nonce: [u8; NONCE_LEN] },
    InvitationWithUserAuth { nonce: [u8; NONCE_LEN] },
    InvitationAccepted { ucmep: u32, name: String },
    InvitationPending,
    /// `method` echoes the invitation command code (0x02 or 0x03);
    /// `username` is empty for shared-secret auth.
    AuthorizationReply { method: u8, digest: [u8; DIGEST_LEN], username: String },
    Ping { id: u32 },
    PingReply { id: u32 },
    RetransmitRequest { first: u16, count: u16 },
    RetransmitError { reason: u16, first: u16 },
    SessionReset,
    SessionResetReply,
    Nak { reason: NakReason, command: u8 },
    Bye { reason: ByeReason },
    ByeReply,
    UmpData { sequence: u16, words: Vec<u32> },
    /// Forward compatibility: unrecognised codes are carried, not dropped.
    Unknown { code: u8, specific: u8, payload: Vec<u8> },
}

#[derive(Debug)]
pub enum CommandError {
    BadMagic,
    Truncated { needed: usize, got: usize },
    BadPayload { code: u8, what: &'static str },
    Oversize { code: u8 },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::BadMagic => write!(f, "datagram does not start with MIDI magic"),
            CommandError::Truncated { needed, got } => {
                write!(f, "truncated command: need {needed} bytes, have {got}")
            }
            CommandError::BadPayload { code, what } => {
                write!(f, "bad payload for command {code:#04x}: {what}")
            }
            CommandError::Oversize { code } => {
                write!(f, "payload for command {code:#04x} exceeds 255 words")
            }
        }
    }
}

impl std::error::Error for CommandError {}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn put_name(payload: &mut BytesMut, name: &str) {
    payload.put_slice(name.as_bytes());
    for _ in name.len()..padded_len(name.len()) {
        payload.put_u8(0);
    }
}

fn trimmed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn put_header(buf: &mut BytesMut, code: u8, specific: u8, payload: &[u8]) -> Result<(), CommandError> {
    debug_assert_eq!(payload.len() % 4, 0, "command payload must be word-aligned");
    let words = payload.len() / 4;
    if words > u8::MAX as usize {
        return Err(CommandError::Oversize { code });
    }
    buf.put_u8(code);
    buf.put_u8(specific);
    buf.put_u8(words as u8);
    buf.put_slice(payload);
    Ok(())
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Invitation { .. } => code::INVITATION,
            Command::InvitationWithAuth { .. } => code::INVITATION_AUTH,
            Command::InvitationWithUserAuth { .. } => code::INVITATION_USER_AUTH,
            Command::InvitationAccepted { .. } => code::INVITATION_ACCEPTED,
            Command::InvitationPending => code::INVITATION_PENDING,
            Command::AuthorizationReply { .. } => code::AUTHORIZATION_REPLY,
            Command::Ping { .. } => code::PING,
            Command::PingReply { .. } => code::PING_REPLY,
            Command::RetransmitRequest { .. } => code::RETRANSMIT_REQUEST,
            Command::RetransmitError { .. } => code::RETRANSMIT_ERROR,
            Command::SessionReset => code::SESSION_RESET,
            Command::SessionResetReply => code::SESSION_RESET_REPLY,
            Command::Nak { .. } => code::NAK,
            Command::Bye { .. } => code::BYE,
            Command::ByeReply => code::BYE_REPLY,
            Command::UmpData { .. } => code::UMP_DATA,
            Command::Unknown { code, .. } => *code,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CommandError> {
        let mut payload = BytesMut::new();
        let mut specific = 0u8;
        match self {
            Command::Invitation { capabilities, ucmep, name } => {
                payload.put_u32(*capabilities);
                payload.put_u32(*ucmep);
                put_name(&mut payload, name);
            }
            Command::InvitationWithAuth { nonce } | Command::InvitationWithUserAuth { nonce } => {
                payload.put_slice(nonce);
            }
            Command::InvitationAccepted { ucmep, name } => {
                payload.put_u32(*ucmep);
                put_name(&mut payload, name);
            }
            Command::InvitationPending | Command::SessionReset | Command::SessionResetReply
            | Command::ByeReply => {}
            Command::AuthorizationReply { method, digest, username } => {
                specific = *method;
                payload.put_slice(digest);
                if !username.is_empty() {
                    put_name(&mut payload, username);
                }
            }
            Command::Ping { id } | Command::PingReply { id } => payload.put_u32(*id),
            Command::RetransmitRequest { first, count } => {
                payload.put_u16(*first);
                payload.put_u16(*count);
            }
            Command::RetransmitError { reason, first } => {
                payload.put_u16(*reason);
                payload.put_u16(*first);
            }
            Command::Nak { reason, command } => {
                payload.put_u8(reason.to_byte());
                payload.put_u8(*command);
                payload.put_u16(0);
            }
            Command::Bye { reason } => specific = reason.to_byte(),
            Command::UmpData { sequence, words } => {
                payload.put_u16(*sequence);
                payload.put_u16(0);
                for word in words {
                    payload.put_u32(*word);
                }
            }
            Command::Unknown { specific: raw, payload: raw_payload, .. } => {
                specific = *raw;
                payload.put_slice(raw_payload);
            }
        }
        put_header(buf, self.code(), specific, &payload)
    }
}

/// Encodes a datagram carrying `commands`.
pub fn encode_datagram(commands: &[Command]) -> Result<Vec<u8>, CommandError> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&MAGIC);
    for command in commands {
        command.encode(&mut buf)?;
    }
    Ok(buf.to_vec())
}

fn parse_command(code: u8, specific: u8, mut payload: &[u8]) -> Result<Command, CommandError> {
    let need = |words: usize, payload: &[u8]| -> Result<(), CommandError> {
        if payload.len() < words * 4 {
            Err(CommandError::BadPayload { code, what: "payload too short" })
        } else {
            Ok(())
        }
    };
    let command = match code {
        code::INVITATION => {
            need(2, payload)?;
            let capabilities = payload.get_u32();
            let ucmep = payload.get_u32();
            Command::Invitation { capabilities, ucmep, name: trimmed_name(payload) }
        }
        code::INVITATION_AUTH | code::INVITATION_USER_AUTH => {
            if payload.len() != NONCE_LEN {
                return Err(CommandError::BadPayload { code, what: "nonce must be 16 bytes" });
            }
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(payload);
            if code == code::INVITATION_AUTH {
                Command::InvitationWithAuth { nonce }
            } else {
                Command::InvitationWithUserAuth { nonce }
            }
        }
        code::INVITATION_ACCEPTED => {
            need(1, payload)?;
            let ucmep = payload.get_u32();
            Command::InvitationAccepted { ucmep, name: trimmed_name(payload) }
        }
        code::INVITATION_PENDING => Command::InvitationPending,
        code::AUTHORIZATION_REPLY => {
            if payload.len() < DIGEST_LEN {
                return Err(CommandError::BadPayload { code, what: "digest must be 32 bytes" });
            }
            let mut digest = [0u8; DIGEST_LEN];
            digest.copy_from_slice(&payload[..DIGEST_LEN]);
            Command::AuthorizationReply {
                method: specific,
                digest,
                username: trimmed_name(&payload[DIGEST_LEN..]),
            }
        }
        code::PING | code::PING_REPLY => {
            need(1, payload)?;
            let id = payload.get_u32();
            if code == code::PING {
                Command::Ping { id }
            } else {
                Command::PingReply { id }
            }
        }
        code::RETRANSMIT_REQUEST => {
            need(1, payload)?;
            Command::RetransmitRequest { first: payload.get_u16(), count: payload.get_u16() }
        }
        code::RETRANSMIT_ERROR => {
            need(1, payload)?;
            Command::RetransmitError { reason: payload.get_u16(), first: payload.get_u16() }
        }
        code::SESSION_RESET => Command::SessionReset,
        code::SESSION_RESET_REPLY => Command::SessionResetReply,
        code::NAK => {
            need(1, payload)?;
            let reason = NakReason::from_byte(payload.get_u8());
            let command = payload.get_u8();
            Command::Nak { reason, command }
        }
        code::BYE => Command::Bye { reason: ByeReason::from_byte(specific) },
        code::BYE_REPLY => Command::ByeReply,
        code::UMP_DATA => {
            need(1, payload)?;
            let sequence = payload.get_u16();
            payload.advance(2);
            let mut words = Vec::with_capacity(payload.len() / 4);
            while payload.remaining() >= 4 {
                words.push(payload.get_u32());
            }
            Command::UmpData { sequence, words }
        }
        _ => Command::Unknown { code, specific, payload: payload.to_vec() },
    };
    Ok(command)
}

/// Decodes a datagram into its commands.
pub fn decode_datagram(data: &[u8]) -> Result<Vec<Command>, CommandError> {
    if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
        return Err(CommandError::BadMagic);
    }
    let mut buf = &data[MAGIC.len()..];
    let mut commands = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            return Err(CommandError::Truncated { needed: 3, got: buf.len() });
        }
        let code = buf.get_u8();
        let specific = buf.get_u8();
        let words = buf.get_u8() as usize;
        let payload_len = words * 4;
        if buf.len() < payload_len {
            return Err(CommandError::Truncated { needed: payload_len, got: buf.len() });
        }
        let (payload, rest) = buf.split_at(payload_len);
        buf = rest;
        commands.push(parse_command(code, specific, payload)?);
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(commands: Vec<Command>) {
        let datagram = encode_datagram(&commands).unwrap();
        assert_eq!(&datagram[..4], b"MIDI");
        assert_eq!(decode_datagram(&datagram).unwrap(), commands);
    }

    #[test]
    fn invitation_roundtrip() {
        roundtrip(vec![Command::Invitation {
            capabilities: CAP_AUTH_SHARED,
            ucmep: 0x1234_5678,
            name: "Studio A".into(),
        }]);
    }

    #[test]
    fn handshake_commands_roundtrip() {
        roundtrip(vec![
            Command::InvitationWithAuth { nonce: [7u8; NONCE_LEN] },
            Command::InvitationAccepted { ucmep: 0xAABB_CCDD, name: "Server".into() },
            Command::InvitationPending,
            Command::AuthorizationReply {
                method: code::INVITATION_USER_AUTH,
                digest: [0x55; DIGEST_LEN],
                username: "alice".into(),
            },
        ]);
    }

    #[test]
    fn control_commands_roundtrip() {
        roundtrip(vec![
            Command::Ping { id: 0xDEAD_BEEF },
            Command::PingReply { id: 0xDEAD_BEEF },
            Command::RetransmitRequest { first: 5, count: 1 },
            Command::RetransmitError { reason: RETRANSMIT_REASON_EVICTED, first: 5 },
            Command::SessionReset,
            Command::SessionResetReply,
            Command::Nak { reason: NakReason::AuthFailed, command: code::AUTHORIZATION_REPLY },
            Command::Bye { reason: ByeReason::Timeout },
            Command::ByeReply,
        ]);
    }

    #[test]
    fn ump_data_roundtrip() {
        roundtrip(vec![Command::UmpData {
            sequence: 0xFFFE,
            words: vec![0x2990_407F, 0x3004_7E7F, 0x0601_0000],
        }]);
    }

    #[test]
    fn ump_data_word_layout() {
        let datagram = encode_datagram(&[Command::UmpData {
            sequence: 0x0102,
            words: vec![0x2190_4060],
        }])
        .unwrap();
        // magic + header + 2 payload words.
        assert_eq!(datagram.len(), 4 + 3 + 8);
        assert_eq!(datagram[4], code::UMP_DATA);
        assert_eq!(datagram[6], 2); // length in words
        assert_eq!(&datagram[7..11], &[0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn unknown_command_is_preserved() {
        roundtrip(vec![
            Command::Unknown { code: 0x42, specific: 0x07, payload: vec![1, 2, 3, 4] },
            Command::Ping { id: 1 },
        ]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(decode_datagram(b"MIDX"), Err(CommandError::BadMagic)));
        assert!(matches!(decode_datagram(b"MI"), Err(CommandError::BadMagic)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut datagram = encode_datagram(&[Command::Ping { id: 9 }]).unwrap();
        datagram.truncate(datagram.len() - 1);
        assert!(matches!(
            decode_datagram(&datagram),
            Err(CommandError::Truncated { .. })
        ));
    }

    #[test]
    fn short_nonce_is_rejected() {
        let mut datagram = b"MIDI".to_vec();
        datagram.extend_from_slice(&[code::INVITATION_AUTH, 0, 1, 1, 2, 3, 4]);
        assert!(matches!(
            decode_datagram(&datagram),
            Err(CommandError::BadPayload { .. })
        ));
    }

    #[test]
    fn name_padding_is_stripped() {
        let datagram = encode_datagram(&[Command::Invitation {
            capabilities: 0,
            ucmep: 1,
            name: "abcde".into(),
        }])
        .unwrap();
        // 2 fixed words + name padded to 8 bytes.
        assert_eq!(datagram[6], 4);
        match &decode_datagram(&datagram).unwrap()[0] {
            Command::Invitation { name, .. } => assert_eq!(name, "abcde"),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
