//! Raw UMP endpoint over a word-aligned byte channel.
//!
//! The Linux ALSA UMP character device delivers whole 32-bit words in CPU
//! byte order. Reads may still split a packet anywhere, so bytes are
//! accumulated into words and words into packets, with short tails carried
//! to the next read. Writes emit each packet in a single `write_all`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, error, warn};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use midi2_core::ump::{decode_packet, encode_packet, UmpPacket};
use midi2_core::CodecError;

use crate::endpoint::UmpEndpoint;

const CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 4096;

/// A UMP endpoint over any byte channel with device framing.
pub struct RawEndpoint {
    tx: mpsc::Sender<UmpPacket>,
    rx: mpsc::Receiver<UmpPacket>,
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RawEndpoint {
    /// Opens a kernel UMP character device for reading and writing.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("opening ump device {}", path.display()))?;
        let (reader, writer) = tokio::io::split(file);
        Ok(Self::spawn(reader, writer))
    }

    /// Bridges an arbitrary reader/writer pair. The device framing rules
    /// apply: native-endian words, packets never split across writes.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, writer_rx) = mpsc::channel::<UmpPacket>(CHANNEL_CAPACITY);
        let (reader_tx, rx) = mpsc::channel::<UmpPacket>(CHANNEL_CAPACITY);
        let (shutdown, reader_shutdown) = watch::channel(false);
        let writer_shutdown = reader_shutdown.clone();

        let reader = tokio::spawn(read_loop(reader, reader_tx, reader_shutdown));
        let writer = tokio::spawn(write_loop(writer, writer_rx, writer_shutdown));

        RawEndpoint { tx, rx, shutdown, reader, writer }
    }

    pub async fn send(&self, packet: UmpPacket) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("raw endpoint writer is gone"))
    }

    pub async fn recv(&mut self) -> Option<UmpPacket> {
        self.rx.recv().await
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        drop(self.tx);
        self.writer.await.context("raw writer task panicked")?;
        self.reader.await.context("raw reader task panicked")?;
        Ok(())
    }
}

#[async_trait]
impl UmpEndpoint for RawEndpoint {
    async fn send(&mut self, packet: UmpPacket) -> Result<()> {
        RawEndpoint::send(self, packet).await
    }

    async fn recv(&mut self) -> Option<UmpPacket> {
        RawEndpoint::recv(self).await
    }
}

async fn read_loop<R>(
    mut reader: R,
    out: mpsc::Sender<UmpPacket>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut bytes = BytesMut::with_capacity(READ_CHUNK * 2);
    let mut words: Vec<u32> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            read = reader.read(&mut chunk) => read,
        };
        let len = match read {
            Ok(0) => {
                if !bytes.is_empty() {
                    error!("device stream ended {} bytes into a word", bytes.len());
                } else if !words.is_empty() {
                    error!("device stream ended {} words into a packet", words.len());
                }
                break;
            }
            Ok(len) => len,
            Err(err) => {
                error!("device read failed: {err}");
                break;
            }
        };
        bytes.extend_from_slice(&chunk[..len]);
        while bytes.len() >= 4 {
            let word = bytes.get_u32_ne();
            words.push(word);
        }
        let mut offset = 0;
        loop {
            match decode_packet(&words[offset..]) {
                Ok((packet, consumed)) => {
                    offset += consumed;
                    if out.send(packet).await.is_err() {
                        return;
                    }
                }
                Err(CodecError::Truncated { .. }) => break,
                Err(err) => {
                    // decode_packet only fails short; anything else is a bug.
                    warn!("unexpected decode failure: {err}");
                    break;
                }
            }
        }
        words.drain(..offset);
    }
    debug!("raw reader loop finished");
}

async fn write_loop<W>(
    mut writer: W,
    mut packets: mpsc::Receiver<UmpPacket>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut words = Vec::with_capacity(4);
    let mut bytes = Vec::with_capacity(16);
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            maybe = packets.recv() => match maybe {
                Some(packet) => packet,
                None => break,
            },
        };
        words.clear();
        encode_packet(&packet, &mut words);
        bytes.clear();
        for word in &words {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        // One write per packet keeps the packet whole on the device side.
        if let Err(err) = writer.write_all(&bytes).await {
            error!("device write failed: {err}");
            break;
        }
        if let Err(err) = writer.flush().await {
            error!("device flush failed: {err}");
            break;
        }
    }
    debug!("raw writer loop finished");
}
