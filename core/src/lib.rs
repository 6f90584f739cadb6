//! Transport-independent MIDI 2.0 protocol code: the Universal MIDI Packet
//! codec, SysEx and Stream message reassembly, the endpoint topology model,
//! and a Standard MIDI File reader with tempo-map timing.

pub mod smf;
pub mod stream;
pub mod sysex;
pub mod topology;
pub mod ump;

use std::fmt;

pub use smf::{Division, SmfFile, TempoMap, TimedPacket, TrackEvent, TrackEventKind};
pub use stream::{StreamMessage, StreamReassembler};
pub use sysex::{Sysex7Assembler, Sysex8Assembler};
pub use topology::{BlockDirection, EndpointTopology, FunctionBlock, Midi1Mode};
pub use ump::{decode_packet, encode_packet, MessageType, SysexStatus, UmpPacket};

/// Error raised while decoding or re-assembling UMP data.
///
/// Codec errors concern a single packet or payload; callers are expected to
/// report them to a diagnostic channel and keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer words than the message type's size requires.
    Truncated { needed: usize, got: usize },
    /// A field held a value the packet layout reserves.
    InvalidReserved { word: u32 },
    /// A new `Start` fragment arrived while a payload was still in progress;
    /// the old payload has been dropped.
    ReassemblyAborted,
    /// A `Continue` or `End` fragment arrived with no preceding `Start`.
    MisorderedFragment,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, got } => {
                write!(f, "truncated packet: need {needed} words, have {got}")
            }
            CodecError::InvalidReserved { word } => {
                write!(f, "reserved field value in word {word:#010x}")
            }
            CodecError::ReassemblyAborted => {
                write!(f, "in-progress reassembly aborted by new Start")
            }
            CodecError::MisorderedFragment => write!(f, "Continue/End fragment without Start"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Error raised while reading a Standard MIDI File.
///
/// SMF errors abort the read; partial files are never surfaced for playback.
#[derive(Debug)]
pub enum SmfError {
    /// A chunk header was missing, misordered, or had an impossible length.
    BadChunk(String),
    /// A variable-length quantity ran past four bytes or off the end.
    BadVlq,
    /// An F0 SysEx event did not end with F7.
    UnterminatedSysex,
    /// The file ended inside a chunk or event.
    Truncated,
    /// A data byte appeared with no running status to attach it to.
    OrphanedData,
}

impl fmt::Display for SmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmfError::BadChunk(what) => write!(f, "malformed SMF chunk: {what}"),
            SmfError::BadVlq => write!(f, "malformed variable-length quantity"),
            SmfError::UnterminatedSysex => write!(f, "SysEx event without terminating F7"),
            SmfError::Truncated => write!(f, "file ended inside a chunk or event"),
            SmfError::OrphanedData => write!(f, "data byte without running status"),
        }
    }
}

impl std::error::Error for SmfError {}
