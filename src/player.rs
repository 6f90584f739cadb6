//! Wall-clock playback of a timed UMP sequence.
//!
//! The scheduler sleeps to each event's offset on the monotonic clock and
//! hands the packet to the sink. Events are never dispatched early and
//! never reordered; under load they may be late. Cancellation takes
//! effect at the next wake, before anything further is sent.

use anyhow::Result;
use log::{debug, info};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use midi2_core::smf::{SmfFile, TimedPacket};

use crate::endpoint::UmpEndpoint;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    Finished,
    Cancelled,
}

/// Plays `sequence` (sorted by offset) into `sink`.
pub async fn play(
    sequence: &[TimedPacket],
    sink: &mut dyn UmpEndpoint,
    mut cancel: watch::Receiver<bool>,
) -> Result<PlayOutcome> {
    let start = Instant::now();
    let mut cancel_alive = true;
    for event in sequence {
        let deadline = start + event.at;
        loop {
            if *cancel.borrow() {
                info!("playback cancelled before {:?}", event.at);
                return Ok(PlayOutcome::Cancelled);
            }
            if cancel_alive {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    changed = cancel.changed() => {
                        if changed.is_err() {
                            // Cancel handle dropped; playback just runs out.
                            cancel_alive = false;
                        }
                    }
                }
            } else {
                sleep_until(deadline).await;
                break;
            }
        }
        sink.send(event.packet.clone()).await?;
    }
    debug!("playback finished, {} events", sequence.len());
    Ok(PlayOutcome::Finished)
}

/// Parses an SMF, projects it to UMP in `group`, and plays it.
pub async fn play_smf(
    data: &[u8],
    group: u8,
    sink: &mut dyn UmpEndpoint,
    cancel: watch::Receiver<bool>,
) -> Result<PlayOutcome> {
    let file = SmfFile::parse(data).map_err(anyhow::Error::new)?;
    let sequence = file.to_ump_sequence(group);
    play(&sequence, sink, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use midi2_core::ump::{Midi1ChannelVoice, UmpPacket};

    use crate::endpoint::channel_pair;

    fn note(n: u8) -> UmpPacket {
        UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, n, 100))
    }

    fn timed(at_ms: u64, packet: UmpPacket) -> TimedPacket {
        TimedPacket { at: Duration::from_millis(at_ms), packet }
    }

    #[tokio::test(start_paused = true)]
    async fn events_fire_at_their_offsets_in_order() {
        let (mut sink, mut probe) = channel_pair(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let sequence = vec![timed(0, note(1)), timed(500, note(2)), timed(1500, note(3))];

        let start = Instant::now();
        let player = tokio::spawn(async move {
            play(&sequence, &mut sink, cancel_rx).await.unwrap()
        });

        let mut arrivals = Vec::new();
        for _ in 0..3 {
            let packet = probe.recv().await.unwrap();
            arrivals.push((Instant::now() - start, packet));
        }
        assert_eq!(player.await.unwrap(), PlayOutcome::Finished);

        assert_eq!(arrivals[0].1, note(1));
        assert_eq!(arrivals[1].1, note(2));
        assert_eq!(arrivals[2].1, note(3));
        // Never early; with the paused clock, exact.
        assert!(arrivals[0].0 >= Duration::ZERO);
        assert!(arrivals[1].0 >= Duration::from_millis(500));
        assert!(arrivals[2].0 >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_event() {
        let (mut sink, mut probe) = channel_pair(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sequence = vec![timed(0, note(1)), timed(10_000, note(2))];

        let player = tokio::spawn(async move {
            play(&sequence, &mut sink, cancel_rx).await.unwrap()
        });

        assert_eq!(probe.recv().await, Some(note(1)));
        cancel_tx.send(true).unwrap();
        assert_eq!(player.await.unwrap(), PlayOutcome::Cancelled);
        assert_eq!(probe.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn smf_playback_matches_tempo_map() {
        // Format 0, division 480, tempo 500000: note on at 0, off at 500 ms.
        let mut data = Vec::new();
        data.extend_from_slice(b"MThd");
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&480u16.to_be_bytes());
        let body: Vec<u8> = vec![
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
            0x00, 0x90, 60, 100, //
            0x83, 0x60, 0x80, 60, 0, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(&body);

        let (mut sink, mut probe) = channel_pair(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let start = Instant::now();
        let player = tokio::spawn(async move {
            play_smf(&data, 0, &mut sink, cancel_rx).await.unwrap()
        });

        assert_eq!(
            probe.recv().await,
            Some(UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, 60, 100)))
        );
        let first_at = Instant::now() - start;
        assert_eq!(
            probe.recv().await,
            Some(UmpPacket::Midi1(Midi1ChannelVoice::note_off(0, 0, 60, 0)))
        );
        let second_at = Instant::now() - start;
        assert_eq!(player.await.unwrap(), PlayOutcome::Finished);
        assert!(first_at < Duration::from_millis(5));
        assert!(second_at >= Duration::from_millis(500));
        assert!(second_at < Duration::from_millis(505));
    }
}
