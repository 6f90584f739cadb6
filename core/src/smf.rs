//! Standard MIDI File (v1) reading and projection to timed UMP packets.
//!
//! Parsing is strict: a malformed chunk, VLQ, or SysEx aborts the read and
//! nothing is surfaced for playback. Timing converts ticks to wall-clock
//! offsets through a tempo map (or fixed SMPTE arithmetic).

use std::time::Duration;

use bytes::Buf;

use crate::sysex::split7;
use crate::ump::{Midi1ChannelVoice, UmpPacket};
use crate::SmfError;

/// Meta event kinds the reader interprets itself.
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_SET_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;

const DEFAULT_US_PER_QUARTER: u32 = 500_000;

/// The MThd time base.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Division {
    TicksPerQuarter(u16),
    Smpte { frames_per_second: u8, ticks_per_frame: u8 },
}

/// One event at an absolute tick within a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackEvent {
    pub tick: u64,
    pub kind: TrackEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackEventKind {
    /// A channel voice event; `data2` is zero for the one-byte statuses.
    Channel { status: u8, channel: u8, data1: u8, data2: u8 },
    /// F0 SysEx payload, without the F0/F7 framing bytes.
    Sysex(Vec<u8>),
    /// F7 escape payload, passed through untouched.
    Escape(Vec<u8>),
    Meta { kind: u8, data: Vec<u8> },
}

/// A parsed Standard MIDI File.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmfFile {
    pub format: u16,
    pub division: Division,
    pub tracks: Vec<Vec<TrackEvent>>,
}

fn read_vlq(buf: &mut &[u8]) -> Result<u32, SmfError> {
    let mut value = 0u32;
    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(SmfError::BadVlq);
        }
        let byte = buf.get_u8();
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(SmfError::BadVlq)
}

fn chunk_header(buf: &mut &[u8]) -> Result<([u8; 4], usize), SmfError> {
    if buf.remaining() < 8 {
        return Err(SmfError::Truncated);
    }
    let mut id = [0u8; 4];
    buf.copy_to_slice(&mut id);
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(SmfError::Truncated);
    }
    Ok((id, len))
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, SmfError> {
    if buf.remaining() < len {
        return Err(SmfError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn channel_data_len(status: u8) -> usize {
    match status {
        0xC | 0xD => 1,
        _ => 2,
    }
}

fn parse_track(mut buf: &[u8]) -> Result<Vec<TrackEvent>, SmfError> {
    let mut events = Vec::new();
    let mut tick = 0u64;
    let mut running: Option<(u8, u8)> = None;
    while buf.has_remaining() {
        tick += read_vlq(&mut buf)? as u64;
        if !buf.has_remaining() {
            return Err(SmfError::Truncated);
        }
        let lead = buf.chunk()[0];
        let kind = match lead {
            0xFF => {
                buf.advance(1);
                if !buf.has_remaining() {
                    return Err(SmfError::Truncated);
                }
                let kind = buf.get_u8();
                let len = read_vlq(&mut buf)? as usize;
                let data = take_bytes(&mut buf, len)?;
                running = None;
                let done = kind == META_END_OF_TRACK;
                events.push(TrackEvent { tick, kind: TrackEventKind::Meta { kind, data } });
                if done {
                    break;
                }
                continue;
            }
            0xF0 => {
                buf.advance(1);
                let len = read_vlq(&mut buf)? as usize;
                let data = take_bytes(&mut buf, len)?;
                running = None;
                match data.split_last() {
                    Some((&0xF7, payload)) => TrackEventKind::Sysex(payload.to_vec()),
                    _ => return Err(SmfError::UnterminatedSysex),
                }
            }
            0xF7 => {
                buf.advance(1);
                let len = read_vlq(&mut buf)? as usize;
                let data = take_bytes(&mut buf, len)?;
                running = None;
                TrackEventKind::Escape(data)
            }
            status_byte if status_byte >= 0xF1 => {
                return Err(SmfError::BadChunk(format!(
                    "unexpected status byte {status_byte:#04x} in track"
                )));
            }
            status_byte if status_byte >= 0x80 => {
                buf.advance(1);
                let status = status_byte >> 4;
                let channel = status_byte & 0xF;
                running = Some((status, channel));
                let data = take_bytes(&mut buf, channel_data_len(status))?;
                TrackEventKind::Channel {
                    status,
                    channel,
                    data1: data[0],
                    data2: data.get(1).copied().unwrap_or(0),
                }
            }
            _ => {
                let (status, channel) = running.ok_or(SmfError::OrphanedData)?;
                let data = take_bytes(&mut buf, channel_data_len(status))?;
                TrackEventKind::Channel {
                    status,
                    channel,
                    data1: data[0],
                    data2: data.get(1).copied().unwrap_or(0),
                }
            }
        };
        events.push(TrackEvent { tick, kind });
    }
    Ok(events)
}

impl SmfFile {
    /// Parses an SMF from `data`. Unknown chunk types are skipped, as the
    /// SMF specification requires.
    pub fn parse(data: &[u8]) -> Result<Self, SmfError> {
        let mut buf = data;
        let (id, len) = chunk_header(&mut buf)?;
        if id != *b"MThd" {
            return Err(SmfError::BadChunk("file does not start with MThd".into()));
        }
        if len < 6 {
            return Err(SmfError::BadChunk(format!("MThd length {len} below 6")));
        }
        let format = buf.get_u16();
        if format > 2 {
            return Err(SmfError::BadChunk(format!("unknown SMF format {format}")));
        }
        let ntrks = buf.get_u16();
        let raw_division = buf.get_u16();
        buf.advance(len - 6);
        let division = if raw_division & 0x8000 != 0 {
            let frames_per_second = 0u8.wrapping_sub((raw_division >> 8) as u8);
            let ticks_per_frame = (raw_division & 0xFF) as u8;
            if frames_per_second == 0 || ticks_per_frame == 0 {
                return Err(SmfError::BadChunk("SMPTE division with zero rate".into()));
            }
            Division::Smpte { frames_per_second, ticks_per_frame }
        } else {
            if raw_division == 0 {
                return Err(SmfError::BadChunk("zero ticks-per-quarter division".into()));
            }
            Division::TicksPerQuarter(raw_division)
        };

        let mut tracks = Vec::with_capacity(ntrks as usize);
        while tracks.len() < ntrks as usize {
            let (id, len) = chunk_header(&mut buf)?;
            let (chunk, rest) = buf.split_at(len);
            buf = rest;
            if id != *b"MTrk" {
                continue;
            }
            tracks.push(parse_track(chunk)?);
        }
        Ok(SmfFile { format, division, tracks })
    }

    /// All tracks merged into one absolute-tick-ordered sequence. Equal
    /// ticks keep the lower track first (stable sort over a track-ordered
    /// chain).
    pub fn merged_events(&self) -> Vec<TrackEvent> {
        let mut merged: Vec<TrackEvent> = self.tracks.iter().flatten().cloned().collect();
        merged.sort_by_key(|event| event.tick);
        merged
    }

    /// Projects the file to wall-clocked UMP packets in `group`.
    ///
    /// Channel voice events become single MT=0x2 packets, SysEx payloads
    /// become SysEx7 chains. Meta and escape events are not projected.
    pub fn to_ump_sequence(&self, group: u8) -> Vec<TimedPacket> {
        let merged = self.merged_events();
        let tempo_map = TempoMap::new(self.division, &merged);
        let mut out = Vec::new();
        for event in &merged {
            let at = tempo_map.tick_to_time(event.tick);
            match &event.kind {
                TrackEventKind::Channel { status, channel, data1, data2 } => {
                    out.push(TimedPacket {
                        at,
                        packet: UmpPacket::Midi1(Midi1ChannelVoice::new(
                            group, *status, *channel, *data1, *data2,
                        )),
                    });
                }
                TrackEventKind::Sysex(payload) => {
                    for packet in split7(group, payload) {
                        out.push(TimedPacket { at, packet: UmpPacket::Sysex7(packet) });
                    }
                }
                TrackEventKind::Escape(_) | TrackEventKind::Meta { .. } => {}
            }
        }
        out
    }
}

/// A UMP packet with its wall-clock offset from sequence start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedPacket {
    pub at: Duration,
    pub packet: UmpPacket,
}

#[derive(Copy, Clone, Debug)]
struct TempoSegment {
    start_tick: u64,
    start_us: u64,
    us_per_quarter: u32,
}

/// Piecewise-linear tick to wall-clock conversion over Set Tempo changes.
///
/// Under SMPTE divisions the file's timing is absolute and tempo events
/// are ignored.
#[derive(Clone, Debug)]
pub struct TempoMap {
    division: Division,
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    /// Builds the map from tick-ordered events (Set Tempo metas apply from
    /// their own tick onward).
    pub fn new(division: Division, ordered_events: &[TrackEvent]) -> Self {
        let mut segments = vec![TempoSegment {
            start_tick: 0,
            start_us: 0,
            us_per_quarter: DEFAULT_US_PER_QUARTER,
        }];
        if let Division::TicksPerQuarter(tpq) = division {
            for event in ordered_events {
                let TrackEventKind::Meta { kind: META_SET_TEMPO, data } = &event.kind else {
                    continue;
                };
                if data.len() != 3 {
                    continue;
                }
                let us_per_quarter =
                    (data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32;
                let last_idx = segments.len() - 1;
                let last = segments[last_idx];
                if event.tick == last.start_tick {
                    segments[last_idx].us_per_quarter = us_per_quarter;
                    continue;
                }
                let elapsed = (event.tick - last.start_tick) as u128
                    * last.us_per_quarter as u128
                    / tpq as u128;
                segments.push(TempoSegment {
                    start_tick: event.tick,
                    start_us: last.start_us + elapsed as u64,
                    us_per_quarter,
                });
            }
        }
        TempoMap { division, segments }
    }

    pub fn tick_to_time(&self, tick: u64) -> Duration {
        match self.division {
            Division::TicksPerQuarter(tpq) => {
                let segment = self
                    .segments
                    .iter()
                    .rev()
                    .find(|s| s.start_tick <= tick)
                    .copied()
                    .unwrap_or(TempoSegment {
                        start_tick: 0,
                        start_us: 0,
                        us_per_quarter: DEFAULT_US_PER_QUARTER,
                    });
                let elapsed = (tick - segment.start_tick) as u128
                    * segment.us_per_quarter as u128
                    / tpq as u128;
                Duration::from_micros(segment.start_us + elapsed as u64)
            }
            Division::Smpte { frames_per_second, ticks_per_frame } => {
                let ticks_per_second = frames_per_second as u128 * ticks_per_frame as u128;
                let us = tick as u128 * 1_000_000 / ticks_per_second;
                Duration::from_micros(us as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ump::SysexStatus;

    fn header(format: u16, ntrks: u16, division: u16) -> Vec<u8> {
        let mut out = b"MThd".to_vec();
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&ntrks.to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        out
    }

    fn track(body: &[u8]) -> Vec<u8> {
        let mut out = b"MTrk".to_vec();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    const END_OF_TRACK: [u8; 4] = [0x00, 0xFF, 0x2F, 0x00];

    #[test]
    fn vlq_decoding() {
        let cases: [(&[u8], u32); 4] = [
            (&[0x00], 0),
            (&[0x7F], 0x7F),
            (&[0x81, 0x48], 200),
            (&[0xFF, 0xFF, 0xFF, 0x7F], 0x0FFF_FFFF),
        ];
        for (bytes, expected) in cases {
            let mut buf = bytes;
            assert_eq!(read_vlq(&mut buf).unwrap(), expected);
        }
        let mut overlong: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(read_vlq(&mut overlong), Err(SmfError::BadVlq)));
    }

    #[test]
    fn single_track_with_tempo_and_notes() {
        let mut body = vec![
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // tempo 500000
            0x00, 0x90, 60, 100, // note on
            0x83, 0x60, 0x80, 60, 0, // delta 480, note off
        ];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 480);
        data.extend_from_slice(&track(&body));

        let file = SmfFile::parse(&data).unwrap();
        assert_eq!(file.format, 0);
        assert_eq!(file.division, Division::TicksPerQuarter(480));
        assert_eq!(file.tracks.len(), 1);

        let sequence = file.to_ump_sequence(0);
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence[0].at, Duration::ZERO);
        assert_eq!(sequence[1].at, Duration::from_millis(500));
        assert_eq!(
            sequence[0].packet,
            UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, 60, 100))
        );
        assert_eq!(
            sequence[1].packet,
            UmpPacket::Midi1(Midi1ChannelVoice::note_off(0, 0, 60, 0))
        );
    }

    #[test]
    fn running_status_reuses_previous_status() {
        let mut body = vec![
            0x00, 0x90, 60, 100, //
            0x10, 61, 101, // running status note on
            0x10, 62, 102,
        ];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 96);
        data.extend_from_slice(&track(&body));

        let file = SmfFile::parse(&data).unwrap();
        let notes: Vec<_> = file.tracks[0]
            .iter()
            .filter_map(|e| match &e.kind {
                TrackEventKind::Channel { data1, .. } => Some((e.tick, *data1)),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![(0, 60), (0x10, 61), (0x20, 62)]);
    }

    #[test]
    fn format_one_merge_is_stable_by_track() {
        let mut t0 = vec![0x00, 0x90, 60, 100];
        t0.extend_from_slice(&END_OF_TRACK);
        let mut t1 = vec![0x00, 0x91, 72, 90];
        t1.extend_from_slice(&END_OF_TRACK);
        let mut data = header(1, 2, 96);
        data.extend_from_slice(&track(&t0));
        data.extend_from_slice(&track(&t1));

        let file = SmfFile::parse(&data).unwrap();
        let merged = file.merged_events();
        let channels: Vec<u8> = merged
            .iter()
            .filter_map(|e| match &e.kind {
                TrackEventKind::Channel { channel, .. } => Some(*channel),
                _ => None,
            })
            .collect();
        // Same tick: the lower track's event must come first.
        assert_eq!(channels, vec![0, 1]);
    }

    #[test]
    fn tempo_change_shifts_later_events() {
        let mut body = vec![
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // 500000 us/quarter
            0x00, 0x90, 60, 100, //
            0x60, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, // at tick 96: 250000
            0x60, 0x80, 60, 0, // at tick 192
        ];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 96);
        data.extend_from_slice(&track(&body));

        let file = SmfFile::parse(&data).unwrap();
        let sequence = file.to_ump_sequence(0);
        // One quarter at 500 ms, then one quarter at 250 ms.
        assert_eq!(sequence[1].at, Duration::from_millis(750));
    }

    #[test]
    fn smpte_division_ignores_tempo() {
        // 25 fps, 40 ticks per frame: 1000 ticks per second.
        let division = ((0u16.wrapping_sub(25) & 0xFF) << 8) | 40;
        let mut body = vec![
            0x00, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, // tempo meta, ignored
            0x81, 0x68, 0x90, 60, 100, // delta 232 ticks
        ];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, division);
        data.extend_from_slice(&track(&body));

        let file = SmfFile::parse(&data).unwrap();
        assert_eq!(
            file.division,
            Division::Smpte { frames_per_second: 25, ticks_per_frame: 40 }
        );
        let sequence = file.to_ump_sequence(0);
        assert_eq!(sequence[0].at, Duration::from_millis(232));
    }

    #[test]
    fn sysex_projects_to_sysex7_chain() {
        let mut body = vec![0x00, 0xF0, 0x05, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 96);
        data.extend_from_slice(&track(&body));

        let file = SmfFile::parse(&data).unwrap();
        assert_eq!(
            file.tracks[0][0].kind,
            TrackEventKind::Sysex(vec![0x7E, 0x7F, 0x06, 0x01])
        );
        let sequence = file.to_ump_sequence(0);
        assert_eq!(sequence.len(), 1);
        match &sequence[0].packet {
            UmpPacket::Sysex7(p) => {
                assert_eq!(p.status().unwrap(), SysexStatus::Complete);
                assert_eq!(p.payload(), vec![0x7E, 0x7F, 0x06, 0x01]);
            }
            other => panic!("expected sysex7 packet, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_sysex_is_rejected() {
        let mut body = vec![0x00, 0xF0, 0x04, 0x7E, 0x7F, 0x06, 0x01];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 96);
        data.extend_from_slice(&track(&body));
        assert!(matches!(
            SmfFile::parse(&data),
            Err(SmfError::UnterminatedSysex)
        ));
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(matches!(
            SmfFile::parse(b"MTrk\x00\x00\x00\x00"),
            Err(SmfError::BadChunk(_))
        ));
    }

    #[test]
    fn truncated_track_is_rejected() {
        let mut data = header(0, 1, 96);
        let mut chunk = b"MTrk".to_vec();
        chunk.extend_from_slice(&100u32.to_be_bytes());
        chunk.extend_from_slice(&[0x00, 0x90]);
        data.extend_from_slice(&chunk);
        assert!(matches!(SmfFile::parse(&data), Err(SmfError::Truncated)));
    }

    #[test]
    fn orphaned_data_byte_is_rejected() {
        let mut body = vec![0x00, 0x3C, 0x40];
        body.extend_from_slice(&END_OF_TRACK);
        let mut data = header(0, 1, 96);
        data.extend_from_slice(&track(&body));
        assert!(matches!(SmfFile::parse(&data), Err(SmfError::OrphanedData)));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut data = header(0, 1, 96);
        let mut alien = b"XFIt".to_vec();
        alien.extend_from_slice(&2u32.to_be_bytes());
        alien.extend_from_slice(&[0xAA, 0xBB]);
        data.extend_from_slice(&alien);
        let mut body = vec![0x00, 0x90, 60, 100];
        body.extend_from_slice(&END_OF_TRACK);
        data.extend_from_slice(&track(&body));
        let file = SmfFile::parse(&data).unwrap();
        assert_eq!(file.tracks.len(), 1);
    }
}
