//! UMP Stream (MT 0xF) messages: endpoint discovery, notifications, and
//! the multi-packet text payloads behind them.
//!
//! Word 0 carries a 2-bit format and a 10-bit status; text-bearing
//! statuses put up to twelve bytes in words 1..3 per packet and chain
//! Start/Continue/End packets for longer strings.

use std::collections::HashMap;

use log::{debug, warn};

use crate::topology::{BlockDirection, DeviceIdentity, FunctionBlock, Midi1Mode};
use crate::ump::{StreamPacket, SysexStatus};
use crate::CodecError;

pub mod status {
    pub const ENDPOINT_DISCOVERY: u16 = 0x00;
    pub const ENDPOINT_INFO: u16 = 0x01;
    pub const DEVICE_IDENTITY: u16 = 0x02;
    pub const ENDPOINT_NAME: u16 = 0x03;
    pub const PRODUCT_INSTANCE_ID: u16 = 0x04;
    pub const STREAM_CONFIG_REQUEST: u16 = 0x05;
    pub const STREAM_CONFIG_NOTIFY: u16 = 0x06;
    pub const FUNCTION_BLOCK_DISCOVERY: u16 = 0x10;
    pub const FUNCTION_BLOCK_INFO: u16 = 0x11;
    pub const FUNCTION_BLOCK_NAME: u16 = 0x12;
}

/// Endpoint Discovery filter bits: which notifications are requested.
pub mod filter {
    pub const ENDPOINT_INFO: u8 = 0x01;
    pub const DEVICE_IDENTITY: u8 = 0x02;
    pub const ENDPOINT_NAME: u8 = 0x04;
    pub const PRODUCT_INSTANCE_ID: u8 = 0x08;
    pub const STREAM_CONFIG: u8 = 0x10;
    pub const ALL: u8 = 0x1F;

    pub const FB_INFO: u8 = 0x01;
    pub const FB_NAME: u8 = 0x02;
    pub const FB_ALL: u8 = 0x03;
}

/// Target value in a Function Block Discovery addressing every block.
pub const FB_TARGET_ALL: u8 = 0x7F;

/// A complete Stream message, after any text reassembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    EndpointDiscovery {
        ump_major: u8,
        ump_minor: u8,
        filter: u8,
    },
    EndpointInfo {
        ump_major: u8,
        ump_minor: u8,
        static_blocks: bool,
        num_function_blocks: u8,
        midi1: bool,
        midi2: bool,
        jr_tx: bool,
        jr_rx: bool,
    },
    DeviceIdentity(DeviceIdentity),
    EndpointName(String),
    ProductInstanceId(String),
    StreamConfigRequest {
        protocol: u8,
        jr_tx: bool,
        jr_rx: bool,
    },
    StreamConfigNotification {
        protocol: u8,
        jr_tx: bool,
        jr_rx: bool,
    },
    FunctionBlockDiscovery {
        /// Block id, or [`FB_TARGET_ALL`].
        block: u8,
        filter: u8,
    },
    FunctionBlockInfo {
        id: u8,
        is_active: bool,
        direction: BlockDirection,
        ui_hint: u8,
        midi1_mode: Midi1Mode,
        first_group: u8,
        num_groups: u8,
    },
    FunctionBlockName {
        block: u8,
        name: String,
    },
}

const TEXT_BYTES_PER_PACKET: usize = 12;

fn words_from_bytes(chunk: &[u8]) -> [u32; 3] {
    let mut bytes = [0u8; TEXT_BYTES_PER_PACKET];
    bytes[..chunk.len()].copy_from_slice(chunk);
    let word = |i: usize| {
        (bytes[i] as u32) << 24
            | (bytes[i + 1] as u32) << 16
            | (bytes[i + 2] as u32) << 8
            | bytes[i + 3] as u32
    };
    [word(0), word(4), word(8)]
}

fn text_packets(status: u16, field: u16, text: &str) -> Vec<StreamPacket> {
    let bytes = text.as_bytes();
    if bytes.len() <= TEXT_BYTES_PER_PACKET {
        return vec![StreamPacket::new(
            SysexStatus::Complete,
            status,
            field,
            words_from_bytes(bytes),
        )];
    }
    let chunks: Vec<&[u8]> = bytes.chunks(TEXT_BYTES_PER_PACKET).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let format = if i == 0 {
                SysexStatus::Start
            } else if i == last {
                SysexStatus::End
            } else {
                SysexStatus::Continue
            };
            StreamPacket::new(format, status, field, words_from_bytes(chunk))
        })
        .collect()
}

fn trimmed_text(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl StreamMessage {
    /// Encodes the message as one or more 128-bit Stream packets.
    pub fn to_packets(&self) -> Vec<StreamPacket> {
        match self {
            StreamMessage::EndpointDiscovery { ump_major, ump_minor, filter } => {
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::ENDPOINT_DISCOVERY,
                    (*ump_major as u16) << 8 | *ump_minor as u16,
                    [*filter as u32, 0, 0],
                )]
            }
            StreamMessage::EndpointInfo {
                ump_major,
                ump_minor,
                static_blocks,
                num_function_blocks,
                midi1,
                midi2,
                jr_tx,
                jr_rx,
            } => {
                let mut w1 = (*num_function_blocks as u32 & 0x7F) << 24;
                if *static_blocks {
                    w1 |= 1 << 31;
                }
                if *midi2 {
                    w1 |= 1 << 9;
                }
                if *midi1 {
                    w1 |= 1 << 8;
                }
                if *jr_tx {
                    w1 |= 1 << 1;
                }
                if *jr_rx {
                    w1 |= 1;
                }
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::ENDPOINT_INFO,
                    (*ump_major as u16) << 8 | *ump_minor as u16,
                    [w1, 0, 0],
                )]
            }
            StreamMessage::DeviceIdentity(identity) => {
                let w1 = (identity.manufacturer[0] as u32) << 16
                    | (identity.manufacturer[1] as u32) << 8
                    | identity.manufacturer[2] as u32;
                let w2 = (identity.family as u32) << 16 | identity.model as u32;
                let w3 = u32::from_be_bytes(identity.revision);
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::DEVICE_IDENTITY,
                    0,
                    [w1, w2, w3],
                )]
            }
            StreamMessage::EndpointName(name) => text_packets(status::ENDPOINT_NAME, 0, name),
            StreamMessage::ProductInstanceId(id) => {
                text_packets(status::PRODUCT_INSTANCE_ID, 0, id)
            }
            StreamMessage::StreamConfigRequest { protocol, jr_tx, jr_rx } => {
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::STREAM_CONFIG_REQUEST,
                    config_field(*protocol, *jr_tx, *jr_rx),
                    [0, 0, 0],
                )]
            }
            StreamMessage::StreamConfigNotification { protocol, jr_tx, jr_rx } => {
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::STREAM_CONFIG_NOTIFY,
                    config_field(*protocol, *jr_tx, *jr_rx),
                    [0, 0, 0],
                )]
            }
            StreamMessage::FunctionBlockDiscovery { block, filter } => {
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::FUNCTION_BLOCK_DISCOVERY,
                    (*block as u16) << 8 | *filter as u16,
                    [0, 0, 0],
                )]
            }
            StreamMessage::FunctionBlockInfo {
                id,
                is_active,
                direction,
                ui_hint,
                midi1_mode,
                first_group,
                num_groups,
            } => {
                let mut field = (*id as u16 & 0x1F) << 8
                    | (*ui_hint as u16 & 0x3) << 4
                    | (midi1_mode.to_bits() as u16) << 2
                    | direction.to_bits() as u16;
                if *is_active {
                    field |= 1 << 15;
                }
                let w1 = (*first_group as u32) << 24 | (*num_groups as u32) << 16;
                vec![StreamPacket::new(
                    SysexStatus::Complete,
                    status::FUNCTION_BLOCK_INFO,
                    field,
                    [w1, 0, 0],
                )]
            }
            StreamMessage::FunctionBlockName { block, name } => {
                text_packets(status::FUNCTION_BLOCK_NAME, (*block as u16) << 8, name)
            }
        }
    }

    pub fn function_block_info(block: &FunctionBlock) -> Self {
        StreamMessage::FunctionBlockInfo {
            id: block.id,
            is_active: block.is_active,
            direction: block.direction,
            ui_hint: block.ui_hint,
            midi1_mode: block.midi1_mode,
            first_group: block.first_group,
            num_groups: block.num_groups,
        }
    }
}

fn config_field(protocol: u8, jr_tx: bool, jr_rx: bool) -> u16 {
    (protocol as u16) << 8 | (jr_tx as u16) << 1 | jr_rx as u16
}

fn parse_fixed(packet: &StreamPacket) -> Option<StreamMessage> {
    let field = packet.field();
    let w1 = packet.0[1];
    match packet.status() {
        status::ENDPOINT_DISCOVERY => Some(StreamMessage::EndpointDiscovery {
            ump_major: (field >> 8) as u8,
            ump_minor: field as u8,
            filter: (w1 & 0xFF) as u8,
        }),
        status::ENDPOINT_INFO => Some(StreamMessage::EndpointInfo {
            ump_major: (field >> 8) as u8,
            ump_minor: field as u8,
            static_blocks: w1 & (1 << 31) != 0,
            num_function_blocks: ((w1 >> 24) & 0x7F) as u8,
            midi2: w1 & (1 << 9) != 0,
            midi1: w1 & (1 << 8) != 0,
            jr_tx: w1 & (1 << 1) != 0,
            jr_rx: w1 & 1 != 0,
        }),
        status::DEVICE_IDENTITY => Some(StreamMessage::DeviceIdentity(DeviceIdentity {
            manufacturer: [(w1 >> 16) as u8, (w1 >> 8) as u8, w1 as u8],
            family: (packet.0[2] >> 16) as u16,
            model: packet.0[2] as u16,
            revision: packet.0[3].to_be_bytes(),
        })),
        status::STREAM_CONFIG_REQUEST => Some(StreamMessage::StreamConfigRequest {
            protocol: (field >> 8) as u8,
            jr_tx: field & 0b10 != 0,
            jr_rx: field & 0b01 != 0,
        }),
        status::STREAM_CONFIG_NOTIFY => Some(StreamMessage::StreamConfigNotification {
            protocol: (field >> 8) as u8,
            jr_tx: field & 0b10 != 0,
            jr_rx: field & 0b01 != 0,
        }),
        status::FUNCTION_BLOCK_DISCOVERY => Some(StreamMessage::FunctionBlockDiscovery {
            block: (field >> 8) as u8,
            filter: field as u8,
        }),
        status::FUNCTION_BLOCK_INFO => Some(StreamMessage::FunctionBlockInfo {
            id: ((field >> 8) & 0x1F) as u8,
            is_active: field & (1 << 15) != 0,
            ui_hint: ((field >> 4) & 0x3) as u8,
            midi1_mode: Midi1Mode::from_bits(((field >> 2) & 0x3) as u8),
            direction: BlockDirection::from_bits((field & 0x3) as u8),
            first_group: (w1 >> 24) as u8,
            num_groups: ((w1 >> 16) & 0xFF) as u8,
        }),
        other => {
            debug!("ignoring stream message with unknown status {other:#x}");
            None
        }
    }
}

fn is_text_status(status: u16) -> bool {
    matches!(
        status,
        status::ENDPOINT_NAME | status::PRODUCT_INSTANCE_ID | status::FUNCTION_BLOCK_NAME
    )
}

fn text_message(status: u16, field: u16, bytes: &[u8]) -> StreamMessage {
    let text = trimmed_text(bytes);
    match status {
        status::ENDPOINT_NAME => StreamMessage::EndpointName(text),
        status::PRODUCT_INSTANCE_ID => StreamMessage::ProductInstanceId(text),
        _ => StreamMessage::FunctionBlockName {
            block: (field >> 8) as u8,
            name: text,
        },
    }
}

/// Reassembles Stream packets into [`StreamMessage`]s.
///
/// Text payloads are buffered per status (Function Block names remember the
/// block id from their `Start` packet). A new `Start` drops an in-progress
/// payload with a [`CodecError::ReassemblyAborted`] diagnostic; the new
/// payload is retained.
#[derive(Default)]
pub struct StreamReassembler {
    in_progress: HashMap<u16, (u16, Vec<u8>)>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &StreamPacket) -> Result<Option<StreamMessage>, CodecError> {
        let status = packet.status();
        if !is_text_status(status) {
            return Ok(parse_fixed(packet));
        }
        let format = packet.format()?;
        let bytes = packet.payload_bytes();
        match format {
            SysexStatus::Complete => {
                if self.in_progress.remove(&status).is_some() {
                    warn!("complete stream text {status:#x} dropped an in-progress payload");
                }
                Ok(Some(text_message(status, packet.field(), &bytes)))
            }
            SysexStatus::Start => {
                let aborted = self
                    .in_progress
                    .insert(status, (packet.field(), bytes.to_vec()))
                    .is_some();
                if aborted {
                    warn!("stream text Start {status:#x} dropped an in-progress payload");
                    return Err(CodecError::ReassemblyAborted);
                }
                Ok(None)
            }
            SysexStatus::Continue => match self.in_progress.get_mut(&status) {
                Some((_, buffer)) => {
                    buffer.extend_from_slice(&bytes);
                    Ok(None)
                }
                None => Err(CodecError::MisorderedFragment),
            },
            SysexStatus::End => match self.in_progress.remove(&status) {
                Some((field, mut buffer)) => {
                    buffer.extend_from_slice(&bytes);
                    Ok(Some(text_message(status, field, &buffer)))
                }
                None => Err(CodecError::MisorderedFragment),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(packets: &[StreamPacket]) -> Option<StreamMessage> {
        let mut reassembler = StreamReassembler::new();
        let mut out = None;
        for packet in packets {
            out = reassembler.push(packet).unwrap();
        }
        out
    }

    #[test]
    fn short_name_is_a_single_complete_packet() {
        let msg = StreamMessage::EndpointName("Synth".into());
        let packets = msg.to_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].format().unwrap(), SysexStatus::Complete);
        assert_eq!(feed(&packets), Some(msg));
    }

    #[test]
    fn long_name_chains_and_reassembles() {
        let name = "A Rather Longer Endpoint Name".to_string();
        let msg = StreamMessage::EndpointName(name.clone());
        let packets = msg.to_packets();
        assert!(packets.len() > 1);
        assert_eq!(packets[0].format().unwrap(), SysexStatus::Start);
        assert_eq!(
            packets.last().unwrap().format().unwrap(),
            SysexStatus::End
        );
        assert_eq!(feed(&packets), Some(StreamMessage::EndpointName(name)));
    }

    #[test]
    fn chained_text_equals_complete_text() {
        // Twelve bytes exactly fits one packet; the same text pushed through
        // a Start/End chain must reassemble to the same message.
        let text = "ExactlyTwelv".to_string();
        let complete = StreamMessage::ProductInstanceId(text.clone()).to_packets();
        assert_eq!(complete.len(), 1);
        let chained = vec![
            StreamPacket::new(
                SysexStatus::Start,
                status::PRODUCT_INSTANCE_ID,
                0,
                complete[0].0[1..].try_into().unwrap(),
            ),
            StreamPacket::new(SysexStatus::End, status::PRODUCT_INSTANCE_ID, 0, [0, 0, 0]),
        ];
        assert_eq!(feed(&complete), feed(&chained));
    }

    #[test]
    fn function_block_info_roundtrip() {
        let block = FunctionBlock {
            id: 5,
            name: String::new(),
            direction: BlockDirection::Output,
            ui_hint: 2,
            first_group: 4,
            num_groups: 2,
            midi1_mode: Midi1Mode::Midi1Only,
            is_active: true,
        };
        let msg = StreamMessage::function_block_info(&block);
        let packets = msg.to_packets();
        assert_eq!(feed(&packets), Some(msg));
    }

    #[test]
    fn function_block_name_keeps_block_id() {
        let msg = StreamMessage::FunctionBlockName {
            block: 7,
            name: "Keys and a Longer Tail".into(),
        };
        let packets = msg.to_packets();
        assert!(packets.len() > 1);
        assert_eq!(feed(&packets), Some(msg));
    }

    #[test]
    fn endpoint_info_roundtrip() {
        let msg = StreamMessage::EndpointInfo {
            ump_major: 1,
            ump_minor: 1,
            static_blocks: true,
            num_function_blocks: 3,
            midi1: true,
            midi2: true,
            jr_tx: false,
            jr_rx: true,
        };
        assert_eq!(feed(&msg.to_packets()), Some(msg));
    }

    #[test]
    fn device_identity_roundtrip() {
        let msg = StreamMessage::DeviceIdentity(DeviceIdentity {
            manufacturer: [0x00, 0x20, 0x29],
            family: 0x5100,
            model: 0x0001,
            revision: [0, 0, 0, 7],
        });
        assert_eq!(feed(&msg.to_packets()), Some(msg));
    }

    #[test]
    fn continue_without_start_is_misordered() {
        let mut reassembler = StreamReassembler::new();
        let orphan = StreamPacket::new(SysexStatus::Continue, status::ENDPOINT_NAME, 0, [0, 0, 0]);
        assert_eq!(
            reassembler.push(&orphan),
            Err(CodecError::MisorderedFragment)
        );
    }

    #[test]
    fn new_start_aborts_previous_payload() {
        let mut reassembler = StreamReassembler::new();
        let start = |text: &str| {
            StreamPacket::new(
                SysexStatus::Start,
                status::ENDPOINT_NAME,
                0,
                words_from_bytes(text.as_bytes()),
            )
        };
        reassembler.push(&start("first")).unwrap();
        assert_eq!(
            reassembler.push(&start("second")),
            Err(CodecError::ReassemblyAborted)
        );
        let end = StreamPacket::new(SysexStatus::End, status::ENDPOINT_NAME, 0, [0, 0, 0]);
        assert_eq!(
            reassembler.push(&end).unwrap(),
            Some(StreamMessage::EndpointName("second".into()))
        );
    }
}
