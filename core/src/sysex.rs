//! Reassembly and fragmentation of SysEx7/SysEx8 payloads.
//!
//! Fragments are keyed by group; a `Complete` packet bypasses state, a new
//! `Start` abandons whatever was in progress on that group.

use log::warn;

use crate::ump::{Sysex7, Sysex8, SysexStatus};
use crate::CodecError;

#[derive(Default)]
struct GroupBuffers {
    buffers: [Option<Vec<u8>>; 16],
}

impl GroupBuffers {
    fn push(
        &mut self,
        group: u8,
        status: SysexStatus,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        let slot = &mut self.buffers[(group & 0xF) as usize];
        match status {
            SysexStatus::Complete => {
                if slot.take().is_some() {
                    warn!("complete sysex on group {group} dropped an in-progress reassembly");
                }
                Ok(Some(bytes))
            }
            SysexStatus::Start => {
                let aborted = slot.replace(bytes).is_some();
                if aborted {
                    warn!("sysex Start on group {group} dropped an in-progress reassembly");
                    return Err(CodecError::ReassemblyAborted);
                }
                Ok(None)
            }
            SysexStatus::Continue => match slot.as_mut() {
                Some(buffer) => {
                    buffer.extend_from_slice(&bytes);
                    Ok(None)
                }
                None => Err(CodecError::MisorderedFragment),
            },
            SysexStatus::End => match slot.take() {
                Some(mut buffer) => {
                    buffer.extend_from_slice(&bytes);
                    Ok(Some(buffer))
                }
                None => Err(CodecError::MisorderedFragment),
            },
        }
    }
}

/// Reassembles SysEx7 packet sequences into contiguous payloads.
///
/// `push` returns `Ok(Some(payload))` when a message completes. A
/// [`CodecError::ReassemblyAborted`] result is a diagnostic: the new
/// fragment has been accepted and reassembly continues from it.
#[derive(Default)]
pub struct Sysex7Assembler {
    groups: GroupBuffers,
}

impl Sysex7Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &Sysex7) -> Result<Option<Vec<u8>>, CodecError> {
        let status = packet.status()?;
        self.groups.push(packet.group(), status, packet.payload())
    }
}

/// Reassembles SysEx8 packet sequences into contiguous payloads.
#[derive(Default)]
pub struct Sysex8Assembler {
    groups: GroupBuffers,
}

impl Sysex8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &Sysex8) -> Result<Option<Vec<u8>>, CodecError> {
        let status = packet.status()?;
        self.groups.push(packet.group(), status, packet.payload())
    }
}

fn chunk_statuses(chunks: usize) -> impl Iterator<Item = SysexStatus> {
    (0..chunks).map(move |i| {
        if chunks == 1 {
            SysexStatus::Complete
        } else if i == 0 {
            SysexStatus::Start
        } else if i + 1 == chunks {
            SysexStatus::End
        } else {
            SysexStatus::Continue
        }
    })
}

/// Splits `payload` into correctly framed SysEx7 packets.
pub fn split7(group: u8, payload: &[u8]) -> Vec<Sysex7> {
    if payload.is_empty() {
        return vec![Sysex7::new(group, SysexStatus::Complete, &[])];
    }
    let chunks: Vec<&[u8]> = payload.chunks(Sysex7::MAX_PAYLOAD).collect();
    chunk_statuses(chunks.len())
        .zip(chunks)
        .map(|(status, chunk)| Sysex7::new(group, status, chunk))
        .collect()
}

/// Splits `payload` into correctly framed SysEx8 packets under `stream_id`.
pub fn split8(group: u8, stream_id: u8, payload: &[u8]) -> Vec<Sysex8> {
    if payload.is_empty() {
        return vec![Sysex8::new(group, SysexStatus::Complete, stream_id, &[])];
    }
    let chunks: Vec<&[u8]> = payload.chunks(Sysex8::MAX_PAYLOAD).collect();
    chunk_statuses(chunks.len())
        .zip(chunks)
        .map(|(status, chunk)| Sysex8::new(group, status, stream_id, chunk))
        .collect()
}
