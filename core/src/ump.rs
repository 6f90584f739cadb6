//! Packing and unpacking of Universal MIDI Packets.
//!
//! A UMP is a 32, 64, 96, or 128 bit group of 32-bit words. The 4-bit
//! Message Type in the top nibble of word 0 fixes the size; decoding never
//! fails on a reserved Message Type, it yields an [`UmpPacket::Opaque`]
//! that round-trips byte-exactly.

use crate::CodecError;

/// The 4-bit Message Type in bits 31..28 of word 0.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Utility = 0x0,
    System = 0x1,
    LegacyChannelVoice = 0x2,
    Data64 = 0x3,
    ChannelVoice = 0x4,
    Data128 = 0x5,
    Reserved6 = 0x6,
    Reserved7 = 0x7,
    Reserved8 = 0x8,
    Reserved9 = 0x9,
    ReservedA = 0xA,
    ReservedB = 0xB,
    ReservedC = 0xC,
    FlexData = 0xD,
    ReservedE = 0xE,
    UmpStream = 0xF,
}

impl MessageType {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0xF {
            0x0 => MessageType::Utility,
            0x1 => MessageType::System,
            0x2 => MessageType::LegacyChannelVoice,
            0x3 => MessageType::Data64,
            0x4 => MessageType::ChannelVoice,
            0x5 => MessageType::Data128,
            0x6 => MessageType::Reserved6,
            0x7 => MessageType::Reserved7,
            0x8 => MessageType::Reserved8,
            0x9 => MessageType::Reserved9,
            0xA => MessageType::ReservedA,
            0xB => MessageType::ReservedB,
            0xC => MessageType::ReservedC,
            0xD => MessageType::FlexData,
            0xE => MessageType::ReservedE,
            _ => MessageType::UmpStream,
        }
    }

    /// Packet size in 32-bit words, per the UMP specification size table.
    pub fn word_count(self) -> usize {
        match self {
            MessageType::Utility | MessageType::System | MessageType::LegacyChannelVoice => 1,
            MessageType::Data64 | MessageType::ChannelVoice => 2,
            MessageType::Data128 => 4,
            MessageType::Reserved6 | MessageType::Reserved7 => 1,
            MessageType::Reserved8 | MessageType::Reserved9 | MessageType::ReservedA => 2,
            MessageType::ReservedB | MessageType::ReservedC => 3,
            MessageType::FlexData | MessageType::ReservedE | MessageType::UmpStream => 4,
        }
    }
}

/// Fragment status nibble used by SysEx7 and SysEx8 packets.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum SysexStatus {
    Complete = 0x0,
    Start = 0x1,
    Continue = 0x2,
    End = 0x3,
}

impl SysexStatus {
    pub fn from_nibble(nibble: u8) -> Result<Self, CodecError> {
        match nibble & 0xF {
            0x0 => Ok(SysexStatus::Complete),
            0x1 => Ok(SysexStatus::Start),
            0x2 => Ok(SysexStatus::Continue),
            0x3 => Ok(SysexStatus::End),
            other => Err(CodecError::InvalidReserved {
                word: (other as u32) << 20,
            }),
        }
    }
}

/// Utility packet (MT 0x0): NOOP, JR Clock, JR Timestamp. Group-less.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Utility(pub u32);

impl Utility {
    pub const NOOP: u8 = 0x0;
    pub const JR_CLOCK: u8 = 0x1;
    pub const JR_TIMESTAMP: u8 = 0x2;

    pub fn noop() -> Self {
        Utility(0)
    }

    pub fn jr_clock(ticks: u16) -> Self {
        Utility((Self::JR_CLOCK as u32) << 20 | ticks as u32)
    }

    pub fn jr_timestamp(ticks: u16) -> Self {
        Utility((Self::JR_TIMESTAMP as u32) << 20 | ticks as u32)
    }

    pub fn status(&self) -> u8 {
        ((self.0 >> 20) & 0xF) as u8
    }

    /// The 16-bit senderclock field of JR Clock / JR Timestamp.
    pub fn ticks(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// System Real Time and System Common packet (MT 0x1).
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct System(pub u32);

impl System {
    pub fn new(group: u8, status: u8, data1: u8, data2: u8) -> Self {
        System(
            0x1000_0000
                | ((group as u32 & 0xF) << 24)
                | ((status as u32) << 16)
                | ((data1 as u32 & 0x7F) << 8)
                | (data2 as u32 & 0x7F),
        )
    }

    pub fn group(&self) -> u8 {
        ((self.0 >> 24) & 0xF) as u8
    }

    /// The full status byte (0xF1..=0xFF).
    pub fn status(&self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub fn data1(&self) -> u8 {
        ((self.0 >> 8) & 0x7F) as u8
    }

    pub fn data2(&self) -> u8 {
        (self.0 & 0x7F) as u8
    }
}

/// MIDI 1.0 Channel Voice packet (MT 0x2).
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Midi1ChannelVoice(pub u32);

impl Midi1ChannelVoice {
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLY_PRESSURE: u8 = 0xA;
    pub const CONTROL_CHANGE: u8 = 0xB;
    pub const PROGRAM_CHANGE: u8 = 0xC;
    pub const CHANNEL_PRESSURE: u8 = 0xD;
    pub const PITCH_BEND: u8 = 0xE;

    pub fn new(group: u8, status: u8, channel: u8, data1: u8, data2: u8) -> Self {
        Midi1ChannelVoice(
            0x2000_0000
                | ((group as u32 & 0xF) << 24)
                | ((status as u32 & 0xF) << 20)
                | ((channel as u32 & 0xF) << 16)
                | ((data1 as u32 & 0x7F) << 8)
                | (data2 as u32 & 0x7F),
        )
    }

    pub fn note_on(group: u8, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(group, Self::NOTE_ON, channel, note, velocity)
    }

    pub fn note_off(group: u8, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(group, Self::NOTE_OFF, channel, note, velocity)
    }

    pub fn poly_pressure(group: u8, channel: u8, note: u8, pressure: u8) -> Self {
        Self::new(group, Self::POLY_PRESSURE, channel, note, pressure)
    }

    pub fn control_change(group: u8, channel: u8, control: u8, value: u8) -> Self {
        Self::new(group, Self::CONTROL_CHANGE, channel, control, value)
    }

    pub fn program_change(group: u8, channel: u8, program: u8) -> Self {
        Self::new(group, Self::PROGRAM_CHANGE, channel, program, 0)
    }

    pub fn channel_pressure(group: u8, channel: u8, pressure: u8) -> Self {
        Self::new(group, Self::CHANNEL_PRESSURE, channel, pressure, 0)
    }

    /// `value` is the 14-bit bend, 0x2000 centered.
    pub fn pitch_bend(group: u8, channel: u8, value: u16) -> Self {
        Self::new(
            group,
            Self::PITCH_BEND,
            channel,
            (value & 0x7F) as u8,
            ((value >> 7) & 0x7F) as u8,
        )
    }

    pub fn group(&self) -> u8 {
        ((self.0 >> 24) & 0xF) as u8
    }

    pub fn status(&self) -> u8 {
        ((self.0 >> 20) & 0xF) as u8
    }

    pub fn channel(&self) -> u8 {
        ((self.0 >> 16) & 0xF) as u8
    }

    pub fn data1(&self) -> u8 {
        ((self.0 >> 8) & 0x7F) as u8
    }

    pub fn data2(&self) -> u8 {
        (self.0 & 0x7F) as u8
    }

    pub fn pitch_bend_value(&self) -> u16 {
        (self.data2() as u16) << 7 | self.data1() as u16
    }
}

/// SysEx7 data packet (MT 0x3): up to six 7-bit payload bytes.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Sysex7(pub [u32; 2]);

impl Sysex7 {
    pub const MAX_PAYLOAD: usize = 6;

    /// Panics if `bytes` exceeds [`Self::MAX_PAYLOAD`]; callers fragment
    /// through [`crate::sysex::split7`].
    pub fn new(group: u8, status: SysexStatus, bytes: &[u8]) -> Self {
        assert!(bytes.len() <= Self::MAX_PAYLOAD, "sysex7 payload over 6 bytes");
        let mut data = [0u8; 6];
        data[..bytes.len()].copy_from_slice(bytes);
        let w0 = 0x3000_0000
            | ((group as u32 & 0xF) << 24)
            | ((status as u32) << 20)
            | ((bytes.len() as u32) << 16)
            | ((data[0] as u32) << 8)
            | data[1] as u32;
        let w1 = (data[2] as u32) << 24
            | (data[3] as u32) << 16
            | (data[4] as u32) << 8
            | data[5] as u32;
        Sysex7([w0, w1])
    }

    pub fn group(&self) -> u8 {
        ((self.0[0] >> 24) & 0xF) as u8
    }

    pub fn status(&self) -> Result<SysexStatus, CodecError> {
        SysexStatus::from_nibble(((self.0[0] >> 20) & 0xF) as u8)
    }

    pub fn payload_len(&self) -> usize {
        (((self.0[0] >> 16) & 0xF) as usize).min(Self::MAX_PAYLOAD)
    }

    pub fn payload(&self) -> Vec<u8> {
        let bytes = [
            ((self.0[0] >> 8) & 0xFF) as u8,
            (self.0[0] & 0xFF) as u8,
            ((self.0[1] >> 24) & 0xFF) as u8,
            ((self.0[1] >> 16) & 0xFF) as u8,
            ((self.0[1] >> 8) & 0xFF) as u8,
            (self.0[1] & 0xFF) as u8,
        ];
        bytes[..self.payload_len()].to_vec()
    }
}

/// MIDI 2.0 Channel Voice packet (MT 0x4). Accessors extract fields only;
/// no semantic interpretation happens here.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Midi2ChannelVoice(pub [u32; 2]);

impl Midi2ChannelVoice {
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLY_PRESSURE: u8 = 0xA;
    pub const CONTROL_CHANGE: u8 = 0xB;
    pub const PROGRAM_CHANGE: u8 = 0xC;
    pub const CHANNEL_PRESSURE: u8 = 0xD;
    pub const PITCH_BEND: u8 = 0xE;

    pub fn new(group: u8, status: u8, channel: u8, index1: u8, index2: u8, data: u32) -> Self {
        let w0 = 0x4000_0000
            | ((group as u32 & 0xF) << 24)
            | ((status as u32 & 0xF) << 20)
            | ((channel as u32 & 0xF) << 16)
            | ((index1 as u32) << 8)
            | index2 as u32;
        Midi2ChannelVoice([w0, data])
    }

    /// `velocity` is 16-bit; `attr_type`/`attr_data` zero when unused.
    pub fn note_on(group: u8, channel: u8, note: u8, velocity: u16, attr_type: u8, attr_data: u16) -> Self {
        Self::new(
            group,
            Self::NOTE_ON,
            channel,
            note,
            attr_type,
            (velocity as u32) << 16 | attr_data as u32,
        )
    }

    pub fn note_off(group: u8, channel: u8, note: u8, velocity: u16, attr_type: u8, attr_data: u16) -> Self {
        Self::new(
            group,
            Self::NOTE_OFF,
            channel,
            note,
            attr_type,
            (velocity as u32) << 16 | attr_data as u32,
        )
    }

    pub fn control_change(group: u8, channel: u8, index: u8, data: u32) -> Self {
        Self::new(group, Self::CONTROL_CHANGE, channel, index, 0, data)
    }

    pub fn channel_pressure(group: u8, channel: u8, data: u32) -> Self {
        Self::new(group, Self::CHANNEL_PRESSURE, channel, 0, 0, data)
    }

    pub fn pitch_bend(group: u8, channel: u8, data: u32) -> Self {
        Self::new(group, Self::PITCH_BEND, channel, 0, 0, data)
    }

    pub fn group(&self) -> u8 {
        ((self.0[0] >> 24) & 0xF) as u8
    }

    pub fn status(&self) -> u8 {
        ((self.0[0] >> 20) & 0xF) as u8
    }

    pub fn channel(&self) -> u8 {
        ((self.0[0] >> 16) & 0xF) as u8
    }

    pub fn index1(&self) -> u8 {
        ((self.0[0] >> 8) & 0xFF) as u8
    }

    pub fn index2(&self) -> u8 {
        (self.0[0] & 0xFF) as u8
    }

    /// Note number for note-shaped statuses.
    pub fn note(&self) -> u8 {
        self.index1() & 0x7F
    }

    /// 16-bit velocity (high half of the data word).
    pub fn velocity(&self) -> u16 {
        (self.0[1] >> 16) as u16
    }

    pub fn attribute_type(&self) -> u8 {
        self.index2()
    }

    pub fn attribute_data(&self) -> u16 {
        (self.0[1] & 0xFFFF) as u16
    }

    pub fn data_word(&self) -> u32 {
        self.0[1]
    }
}

/// SysEx8 data packet (MT 0x5): a stream id and up to 13 payload bytes.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Sysex8(pub [u32; 4]);

impl Sysex8 {
    pub const MAX_PAYLOAD: usize = 13;

    /// Panics if `bytes` exceeds [`Self::MAX_PAYLOAD`]; callers fragment
    /// through [`crate::sysex::split8`].
    pub fn new(group: u8, status: SysexStatus, stream_id: u8, bytes: &[u8]) -> Self {
        assert!(bytes.len() <= Self::MAX_PAYLOAD, "sysex8 payload over 13 bytes");
        let mut data = [0u8; 13];
        data[..bytes.len()].copy_from_slice(bytes);
        let w0 = 0x5000_0000
            | ((group as u32 & 0xF) << 24)
            | ((status as u32) << 20)
            | ((bytes.len() as u32) << 16)
            | ((stream_id as u32) << 8)
            | data[0] as u32;
        let pack = |a: u8, b: u8, c: u8, d: u8| {
            (a as u32) << 24 | (b as u32) << 16 | (c as u32) << 8 | d as u32
        };
        Sysex8([
            w0,
            pack(data[1], data[2], data[3], data[4]),
            pack(data[5], data[6], data[7], data[8]),
            pack(data[9], data[10], data[11], data[12]),
        ])
    }

    pub fn group(&self) -> u8 {
        ((self.0[0] >> 24) & 0xF) as u8
    }

    pub fn status(&self) -> Result<SysexStatus, CodecError> {
        SysexStatus::from_nibble(((self.0[0] >> 20) & 0xF) as u8)
    }

    pub fn stream_id(&self) -> u8 {
        ((self.0[0] >> 8) & 0xFF) as u8
    }

    pub fn payload_len(&self) -> usize {
        (((self.0[0] >> 16) & 0xF) as usize).min(Self::MAX_PAYLOAD)
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::MAX_PAYLOAD);
        bytes.push((self.0[0] & 0xFF) as u8);
        for word in &self.0[1..] {
            bytes.push((word >> 24) as u8);
            bytes.push((word >> 16) as u8);
            bytes.push((word >> 8) as u8);
            bytes.push(*word as u8);
        }
        bytes.truncate(self.payload_len());
        bytes
    }
}

/// Flex Data packet (MT 0xD). Carried intact; only addressing is exposed.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct FlexData(pub [u32; 4]);

impl FlexData {
    pub fn group(&self) -> u8 {
        ((self.0[0] >> 24) & 0xF) as u8
    }

    pub fn status_bank(&self) -> u8 {
        ((self.0[0] >> 8) & 0xFF) as u8
    }

    pub fn status(&self) -> u8 {
        (self.0[0] & 0xFF) as u8
    }
}

/// UMP Stream packet (MT 0xF): 2-bit format, 10-bit status, a 16-bit
/// status-specific field, and three payload words. Group-less.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct StreamPacket(pub [u32; 4]);

impl StreamPacket {
    /// `format` uses the same Complete/Start/Continue/End encoding as SysEx.
    pub fn new(format: SysexStatus, status: u16, field: u16, words: [u32; 3]) -> Self {
        let w0 = 0xF000_0000
            | ((format as u32) << 26)
            | ((status as u32 & 0x3FF) << 16)
            | field as u32;
        StreamPacket([w0, words[0], words[1], words[2]])
    }

    pub fn format(&self) -> Result<SysexStatus, CodecError> {
        SysexStatus::from_nibble(((self.0[0] >> 26) & 0x3) as u8)
    }

    pub fn status(&self) -> u16 {
        ((self.0[0] >> 16) & 0x3FF) as u16
    }

    pub fn field(&self) -> u16 {
        (self.0[0] & 0xFFFF) as u16
    }

    /// The twelve payload bytes of words 1..3, big-endian byte order.
    pub fn payload_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        for (i, word) in self.0[1..].iter().enumerate() {
            out[i * 4] = (word >> 24) as u8;
            out[i * 4 + 1] = (word >> 16) as u8;
            out[i * 4 + 2] = (word >> 8) as u8;
            out[i * 4 + 3] = *word as u8;
        }
        out
    }
}

/// A decoded Universal MIDI Packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UmpPacket {
    Utility(Utility),
    System(System),
    Midi1(Midi1ChannelVoice),
    Sysex7(Sysex7),
    Midi2(Midi2ChannelVoice),
    Sysex8(Sysex8),
    Flex(FlexData),
    Stream(StreamPacket),
    /// A reserved Message Type, preserved verbatim at the size its MT
    /// dictates so encoding round-trips byte-exactly.
    Opaque { mt: u8, words: Vec<u32> },
}

impl UmpPacket {
    pub fn message_type(&self) -> MessageType {
        match self {
            UmpPacket::Utility(_) => MessageType::Utility,
            UmpPacket::System(_) => MessageType::System,
            UmpPacket::Midi1(_) => MessageType::LegacyChannelVoice,
            UmpPacket::Sysex7(_) => MessageType::Data64,
            UmpPacket::Midi2(_) => MessageType::ChannelVoice,
            UmpPacket::Sysex8(_) => MessageType::Data128,
            UmpPacket::Flex(_) => MessageType::FlexData,
            UmpPacket::Stream(_) => MessageType::UmpStream,
            UmpPacket::Opaque { mt, .. } => MessageType::from_nibble(*mt),
        }
    }

    /// The 4-bit Group, absent for Utility and Stream packets.
    pub fn group(&self) -> Option<u8> {
        match self {
            UmpPacket::Utility(_) | UmpPacket::Stream(_) => None,
            UmpPacket::System(p) => Some(p.group()),
            UmpPacket::Midi1(p) => Some(p.group()),
            UmpPacket::Sysex7(p) => Some(p.group()),
            UmpPacket::Midi2(p) => Some(p.group()),
            UmpPacket::Sysex8(p) => Some(p.group()),
            UmpPacket::Flex(p) => Some(p.group()),
            UmpPacket::Opaque { words, .. } => words.first().map(|w| ((w >> 24) & 0xF) as u8),
        }
    }

    pub fn word_count(&self) -> usize {
        match self {
            UmpPacket::Opaque { words, .. } => words.len(),
            other => other.message_type().word_count(),
        }
    }
}

/// Decodes one packet from the front of `words`, returning it together with
/// the number of words consumed.
pub fn decode_packet(words: &[u32]) -> Result<(UmpPacket, usize), CodecError> {
    let first = *words.first().ok_or(CodecError::Truncated { needed: 1, got: 0 })?;
    let mt = MessageType::from_nibble((first >> 28) as u8);
    let size = mt.word_count();
    if words.len() < size {
        return Err(CodecError::Truncated {
            needed: size,
            got: words.len(),
        });
    }
    let packet = match mt {
        MessageType::Utility => UmpPacket::Utility(Utility(first)),
        MessageType::System => UmpPacket::System(System(first)),
        MessageType::LegacyChannelVoice => UmpPacket::Midi1(Midi1ChannelVoice(first)),
        MessageType::Data64 => UmpPacket::Sysex7(Sysex7([words[0], words[1]])),
        MessageType::ChannelVoice => UmpPacket::Midi2(Midi2ChannelVoice([words[0], words[1]])),
        MessageType::Data128 => {
            UmpPacket::Sysex8(Sysex8([words[0], words[1], words[2], words[3]]))
        }
        MessageType::FlexData => {
            UmpPacket::Flex(FlexData([words[0], words[1], words[2], words[3]]))
        }
        MessageType::UmpStream => {
            UmpPacket::Stream(StreamPacket([words[0], words[1], words[2], words[3]]))
        }
        reserved => UmpPacket::Opaque {
            mt: reserved as u8,
            words: words[..size].to_vec(),
        },
    };
    Ok((packet, size))
}

/// Appends the packet's words to `out`.
pub fn encode_packet(packet: &UmpPacket, out: &mut Vec<u32>) {
    match packet {
        UmpPacket::Utility(p) => out.push(p.0),
        UmpPacket::System(p) => out.push(p.0),
        UmpPacket::Midi1(p) => out.push(p.0),
        UmpPacket::Sysex7(p) => out.extend_from_slice(&p.0),
        UmpPacket::Midi2(p) => out.extend_from_slice(&p.0),
        UmpPacket::Sysex8(p) => out.extend_from_slice(&p.0),
        UmpPacket::Flex(p) => out.extend_from_slice(&p.0),
        UmpPacket::Stream(p) => out.extend_from_slice(&p.0),
        UmpPacket::Opaque { words, .. } => out.extend_from_slice(words),
    }
}

/// Decodes every packet in `words`; a short tail is an error.
pub fn decode_all(mut words: &[u32]) -> Result<Vec<UmpPacket>, CodecError> {
    let mut packets = Vec::new();
    while !words.is_empty() {
        let (packet, consumed) = decode_packet(words)?;
        packets.push(packet);
        words = &words[consumed..];
    }
    Ok(packets)
}
