//! Endpoint topology discovery over UMP Stream messages.
//!
//! The client fires an Endpoint Discovery and a Function Block Discovery,
//! then collects notifications until nothing new has arrived for a
//! quiescence window. The server answers from a statically configured
//! topology.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use midi2_core::stream::{filter, StreamMessage, FB_TARGET_ALL};
use midi2_core::topology::{EndpointTopology, FunctionBlock, Midi1Mode};
use midi2_core::ump::UmpPacket;
use midi2_core::StreamReassembler;

use crate::endpoint::UmpEndpoint;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// How long to wait after the last novel notification.
    pub quiescence: Duration,
    /// Hard ceiling on the whole discovery exchange.
    pub overall_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            quiescence: Duration::from_millis(300),
            overall_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Default)]
struct TopologyBuilder {
    info: Option<StreamMessage>,
    name: Option<String>,
    product_instance_id: Option<String>,
    identity: Option<midi2_core::topology::DeviceIdentity>,
    blocks: Vec<FunctionBlock>,
    named: HashSet<u8>,
}

impl TopologyBuilder {
    /// Returns whether the message taught us anything new.
    fn apply(&mut self, message: StreamMessage) -> bool {
        match message {
            StreamMessage::EndpointInfo { .. } => {
                let novel = self.info.as_ref() != Some(&message);
                self.info = Some(message);
                novel
            }
            StreamMessage::DeviceIdentity(identity) => {
                let novel = self.identity.as_ref() != Some(&identity);
                self.identity = Some(identity);
                novel
            }
            StreamMessage::EndpointName(name) => {
                let novel = self.name.as_deref() != Some(name.as_str());
                self.name = Some(name);
                novel
            }
            StreamMessage::ProductInstanceId(id) => {
                let novel = self.product_instance_id.as_deref() != Some(id.as_str());
                self.product_instance_id = Some(id);
                novel
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
                let block = FunctionBlock {
                    id,
                    name: String::new(),
                    direction,
                    ui_hint,
                    first_group,
                    num_groups,
                    midi1_mode,
                    is_active,
                };
                match self.blocks.iter_mut().find(|b| b.id == id) {
                    Some(existing) => {
                        let name = existing.name.clone();
                        let mut refreshed = block;
                        refreshed.name = name;
                        let novel = *existing != refreshed;
                        *existing = refreshed;
                        novel
                    }
                    None => {
                        self.blocks.push(block);
                        true
                    }
                }
            }
            StreamMessage::FunctionBlockName { block, name } => {
                let novel = self.named.insert(block);
                match self.blocks.iter_mut().find(|b| b.id == block) {
                    Some(existing) => existing.name = name,
                    None => {
                        // Name before info; hold a stub the info will fill.
                        self.blocks.push(FunctionBlock {
                            id: block,
                            name,
                            direction: midi2_core::topology::BlockDirection::Bidirectional,
                            ui_hint: 0,
                            first_group: 0,
                            num_groups: 1,
                            midi1_mode: Midi1Mode::None,
                            is_active: false,
                        });
                    }
                }
                novel
            }
            StreamMessage::StreamConfigNotification { .. } => false,
            other => {
                debug!("ignoring non-notification stream message {other:?}");
                false
            }
        }
    }

    /// All announced pieces present: info, names, and every block.
    fn complete(&self) -> bool {
        let Some(StreamMessage::EndpointInfo { num_function_blocks, .. }) = self.info else {
            return false;
        };
        self.name.is_some()
            && self.product_instance_id.is_some()
            && self.blocks.len() == num_function_blocks as usize
            && self.blocks.iter().all(|b| self.named.contains(&b.id))
    }

    fn build(self) -> Option<EndpointTopology> {
        let StreamMessage::EndpointInfo {
            ump_major,
            ump_minor,
            midi1,
            midi2,
            jr_tx,
            jr_rx,
            ..
        } = self.info?
        else {
            return None;
        };
        let mut blocks = self.blocks;
        blocks.sort_by_key(|b| b.id);
        Some(EndpointTopology {
            name: self.name.unwrap_or_default(),
            product_instance_id: self.product_instance_id.unwrap_or_default(),
            ump_version: (ump_major, ump_minor),
            supports_midi1_protocol: midi1,
            supports_midi2_protocol: midi2,
            supports_jr_tx: jr_tx,
            supports_jr_rx: jr_rx,
            device_identity: self.identity.unwrap_or_default(),
            function_blocks: blocks,
        })
    }
}

/// Queries the peer behind `endpoint` and assembles its topology.
pub async fn discover(
    endpoint: &mut dyn UmpEndpoint,
    config: &DiscoveryConfig,
) -> Result<EndpointTopology> {
    let requests = [
        StreamMessage::EndpointDiscovery { ump_major: 1, ump_minor: 1, filter: filter::ALL },
        StreamMessage::FunctionBlockDiscovery { block: FB_TARGET_ALL, filter: filter::FB_ALL },
    ];
    for request in requests {
        for packet in request.to_packets() {
            endpoint.send(UmpPacket::Stream(packet)).await?;
        }
    }

    let started = Instant::now();
    let hard_deadline = started + config.overall_timeout;
    let mut quiet_deadline = started + config.quiescence;
    let mut reassembler = StreamReassembler::new();
    let mut builder = TopologyBuilder::default();

    loop {
        let deadline = quiet_deadline.min(hard_deadline);
        let received = tokio::select! {
            maybe = endpoint.recv() => match maybe {
                Some(packet) => packet,
                None => break,
            },
            _ = sleep_until(deadline) => break,
        };
        let UmpPacket::Stream(stream_packet) = received else {
            continue; // Unrelated traffic shares the endpoint.
        };
        let message = match reassembler.push(&stream_packet) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!("discovery reassembly hiccup: {err}");
                continue;
            }
        };
        if builder.apply(message) {
            quiet_deadline = Instant::now() + config.quiescence;
        }
        if builder.complete() {
            debug!("discovery complete before quiescence window");
            break;
        }
    }

    match builder.build() {
        Some(topology) => {
            info!(
                "discovered '{}' with {} function blocks",
                topology.name,
                topology.function_blocks.len()
            );
            Ok(topology)
        }
        None => bail!("peer answered no Endpoint Info within the discovery window"),
    }
}

/// Answers discovery queries from a fixed topology.
pub struct TopologyServer {
    topology: EndpointTopology,
}

impl TopologyServer {
    pub fn new(topology: EndpointTopology) -> Result<Self> {
        topology
            .validate()
            .map_err(|reason| anyhow::anyhow!("invalid topology: {reason}"))?;
        Ok(TopologyServer { topology })
    }

    pub fn topology(&self) -> &EndpointTopology {
        &self.topology
    }

    fn endpoint_info(&self) -> StreamMessage {
        let t = &self.topology;
        StreamMessage::EndpointInfo {
            ump_major: t.ump_version.0,
            ump_minor: t.ump_version.1,
            static_blocks: true,
            num_function_blocks: t.function_blocks.len() as u8,
            midi1: t.supports_midi1_protocol,
            midi2: t.supports_midi2_protocol,
            jr_tx: t.supports_jr_tx,
            jr_rx: t.supports_jr_rx,
        }
    }

    fn stream_config(&self) -> StreamMessage {
        let t = &self.topology;
        StreamMessage::StreamConfigNotification {
            protocol: if t.supports_midi2_protocol { 2 } else { 1 },
            jr_tx: t.supports_jr_tx,
            jr_rx: t.supports_jr_rx,
        }
    }

    /// The packets answering one incoming packet. Pure; the caller owns
    /// transport and ordering.
    pub fn handle(&self, packet: &UmpPacket) -> Vec<UmpPacket> {
        let UmpPacket::Stream(stream_packet) = packet else {
            return Vec::new();
        };
        let mut reassembler = StreamReassembler::new();
        let message = match reassembler.push(stream_packet) {
            Ok(Some(message)) => message,
            _ => return Vec::new(),
        };
        let mut replies: Vec<StreamMessage> = Vec::new();
        match message {
            StreamMessage::EndpointDiscovery { filter: asked, .. } => {
                if asked & filter::ENDPOINT_INFO != 0 {
                    replies.push(self.endpoint_info());
                }
                if asked & filter::DEVICE_IDENTITY != 0 {
                    replies.push(StreamMessage::DeviceIdentity(
                        self.topology.device_identity.clone(),
                    ));
                }
                if asked & filter::ENDPOINT_NAME != 0 {
                    replies.push(StreamMessage::EndpointName(self.topology.name.clone()));
                }
                if asked & filter::PRODUCT_INSTANCE_ID != 0 {
                    replies.push(StreamMessage::ProductInstanceId(
                        self.topology.product_instance_id.clone(),
                    ));
                }
                if asked & filter::STREAM_CONFIG != 0 {
                    replies.push(self.stream_config());
                }
            }
            StreamMessage::FunctionBlockDiscovery { block, filter: asked } => {
                for fb in &self.topology.function_blocks {
                    if block != FB_TARGET_ALL && fb.id != block {
                        continue;
                    }
                    if asked & filter::FB_INFO != 0 {
                        replies.push(StreamMessage::function_block_info(fb));
                    }
                    if asked & filter::FB_NAME != 0 {
                        replies.push(StreamMessage::FunctionBlockName {
                            block: fb.id,
                            name: fb.name.clone(),
                        });
                    }
                }
            }
            StreamMessage::StreamConfigRequest { .. } => {
                replies.push(self.stream_config());
            }
            _ => {}
        }
        replies
            .iter()
            .flat_map(StreamMessage::to_packets)
            .map(UmpPacket::Stream)
            .collect()
    }

    /// Serves queries from `endpoint` until cancelled or the peer goes away.
    pub async fn serve(
        &self,
        endpoint: &mut dyn UmpEndpoint,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let packet = tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                maybe = endpoint.recv() => match maybe {
                    Some(packet) => packet,
                    None => return Ok(()),
                },
            };
            for reply in self.handle(&packet) {
                endpoint.send(reply).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi2_core::topology::BlockDirection;

    use crate::endpoint::channel_pair;

    fn sample_topology() -> EndpointTopology {
        EndpointTopology {
            name: "Test Rig".into(),
            product_instance_id: "TR-0001".into(),
            ump_version: (1, 1),
            supports_midi1_protocol: true,
            supports_midi2_protocol: true,
            supports_jr_tx: false,
            supports_jr_rx: false,
            device_identity: Default::default(),
            function_blocks: vec![FunctionBlock {
                id: 0,
                name: "Synth".into(),
                direction: BlockDirection::Bidirectional,
                ui_hint: 0,
                first_group: 0,
                num_groups: 4,
                midi1_mode: Midi1Mode::None,
                is_active: true,
            }],
        }
    }

    #[test]
    fn server_answers_only_what_was_asked() {
        let server = TopologyServer::new(sample_topology()).unwrap();
        let ask_name_only = StreamMessage::EndpointDiscovery {
            ump_major: 1,
            ump_minor: 1,
            filter: filter::ENDPOINT_NAME,
        };
        let replies = server.handle(&UmpPacket::Stream(ask_name_only.to_packets()[0]));
        assert_eq!(replies.len(), 1);

        let mut reassembler = StreamReassembler::new();
        let UmpPacket::Stream(packet) = &replies[0] else { panic!("not a stream packet") };
        assert_eq!(
            reassembler.push(packet).unwrap(),
            Some(StreamMessage::EndpointName("Test Rig".into()))
        );
    }

    #[test]
    fn server_answers_single_block_queries() {
        let server = TopologyServer::new(sample_topology()).unwrap();
        let ask = StreamMessage::FunctionBlockDiscovery { block: 0, filter: filter::FB_ALL };
        let replies = server.handle(&UmpPacket::Stream(ask.to_packets()[0]));
        assert_eq!(replies.len(), 2); // info + short name

        let ask_missing = StreamMessage::FunctionBlockDiscovery { block: 9, filter: filter::FB_ALL };
        assert!(server.handle(&UmpPacket::Stream(ask_missing.to_packets()[0])).is_empty());
    }

    #[tokio::test]
    async fn client_assembles_served_topology() {
        let topology = sample_topology();
        let (mut client_side, mut server_side) = channel_pair(64);
        let server = TopologyServer::new(topology.clone()).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let server_task = tokio::spawn(async move {
            let _ = server.serve(&mut server_side, cancel_rx).await;
        });

        let discovered = discover(
            &mut client_side,
            &DiscoveryConfig { quiescence: Duration::from_millis(50), ..Default::default() },
        )
        .await
        .unwrap();

        assert_eq!(discovered, topology);
        drop(client_side);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut client_side, _server_side) = channel_pair(8);
        let result = discover(
            &mut client_side,
            &DiscoveryConfig {
                quiescence: Duration::from_millis(20),
                overall_timeout: Duration::from_millis(100),
            },
        )
        .await;
        assert!(result.is_err());
    }
}
