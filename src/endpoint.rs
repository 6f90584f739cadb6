//! The endpoint seam: anything that can exchange UMP packets.
//!
//! Concrete endpoints (UDP sessions, raw devices, in-process channel
//! pairs) all speak through [`UmpEndpoint`], so discovery and playback
//! do not care what carries their packets.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use midi2_core::ump::UmpPacket;
use midi2_network::{AuthMethod, UdpEndpoint};

use crate::config::Config;
use crate::raw::RawEndpoint;

/// A bidirectional UMP packet stream.
#[async_trait]
pub trait UmpEndpoint: Send {
    async fn send(&mut self, packet: UmpPacket) -> Result<()>;
    /// `None` means the endpoint is gone (peer closed, device unplugged).
    async fn recv(&mut self) -> Option<UmpPacket>;
}

#[async_trait]
impl UmpEndpoint for UdpEndpoint {
    async fn send(&mut self, packet: UmpPacket) -> Result<()> {
        UdpEndpoint::send(self, packet).await
    }

    async fn recv(&mut self) -> Option<UmpPacket> {
        UdpEndpoint::recv(self).await
    }
}

/// Where an endpoint lives, as handed over by the address-parsing layer.
#[derive(Clone, Debug)]
pub enum EndpointLocator {
    /// A kernel UMP character device.
    Device { path: PathBuf, group: Option<u8> },
    /// A Network MIDI 2.0 UDP peer.
    Udp { addr: SocketAddr, auth: Option<AuthMethod>, group: Option<u8> },
}

impl EndpointLocator {
    pub fn group(&self) -> Option<u8> {
        match self {
            EndpointLocator::Device { group, .. } => *group,
            EndpointLocator::Udp { group, .. } => *group,
        }
    }
}

/// Opens the endpoint a locator points at.
pub async fn open(locator: &EndpointLocator, config: &Config) -> Result<Box<dyn UmpEndpoint>> {
    match locator {
        EndpointLocator::Device { path, .. } => {
            Ok(Box::new(RawEndpoint::open(path).await?))
        }
        EndpointLocator::Udp { addr, auth, .. } => {
            let mut session = config.session_config();
            if auth.is_some() {
                session.auth = auth.clone();
            }
            Ok(Box::new(midi2_network::connect(*addr, session).await?))
        }
    }
}

/// Two endpoints wired back to back in process. What one sends, the
/// other receives. Useful for tests and for stacking protocol layers
/// without a transport.
pub struct ChannelEndpoint {
    tx: mpsc::Sender<UmpPacket>,
    rx: mpsc::Receiver<UmpPacket>,
}

pub fn channel_pair(capacity: usize) -> (ChannelEndpoint, ChannelEndpoint) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        ChannelEndpoint { tx: a_tx, rx: b_rx },
        ChannelEndpoint { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl UmpEndpoint for ChannelEndpoint {
    async fn send(&mut self, packet: UmpPacket) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("peer endpoint dropped"))
    }

    async fn recv(&mut self) -> Option<UmpPacket> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi2_core::ump::Midi1ChannelVoice;

    #[tokio::test]
    async fn channel_pair_crosses_over() {
        let (mut a, mut b) = channel_pair(8);
        let packet = UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, 60, 100));
        a.send(packet.clone()).await.unwrap();
        assert_eq!(b.recv().await, Some(packet));
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (mut a, b) = channel_pair(8);
        drop(b);
        assert!(a
            .send(UmpPacket::Midi1(Midi1ChannelVoice::note_on(0, 0, 1, 1)))
            .await
            .is_err());
        assert_eq!(a.recv().await, None);
    }
}
