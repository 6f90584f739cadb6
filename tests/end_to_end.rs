//! End-to-end exercises across the crates: UDP sessions carrying
//! discovery and SMF playback, and raw endpoints over a byte channel.

use std::time::Duration;

use tokio::sync::watch;

use midi2_core::topology::{BlockDirection, EndpointTopology, FunctionBlock, Midi1Mode};
use midi2_core::ump::{Midi1ChannelVoice, UmpPacket};
use midi2net::{
    channel_pair, discover, play_smf, Config, DiscoveryConfig, RawEndpoint, TopologyServer,
};
use midi2_network::{connect, serve, SessionConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_topology() -> EndpointTopology {
    EndpointTopology {
        name: "Integration Rig".into(),
        product_instance_id: "IR-1".into(),
        function_blocks: vec![
            FunctionBlock {
                id: 0,
                name: "Synth".into(),
                direction: BlockDirection::Bidirectional,
                ui_hint: 0,
                first_group: 0,
                num_groups: 4,
                midi1_mode: Midi1Mode::None,
                is_active: true,
            },
            FunctionBlock {
                id: 1,
                name: "A Control Surface With A Longer Name".into(),
                direction: BlockDirection::Input,
                ui_hint: 1,
                first_group: 4,
                num_groups: 1,
                midi1_mode: Midi1Mode::Midi1Only,
                is_active: true,
            },
        ],
        ..EndpointTopology::default()
    }
}

fn smf_fixture() -> Vec<u8> {
    // Format 0, division 480, tempo 50 ms per quarter: two quick events.
    let mut data = Vec::new();
    data.extend_from_slice(b"MThd");
    data.extend_from_slice(&6u32.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&480u16.to_be_bytes());
    let body: Vec<u8> = vec![
        0x00, 0xFF, 0x51, 0x03, 0x00, 0xC3, 0x50, // tempo 50000 us
        0x00, 0x90, 60, 100, //
        0x83, 0x60, 0x80, 60, 0, // one quarter later
        0x00, 0xFF, 0x2F, 0x00,
    ];
    data.extend_from_slice(b"MTrk");
    data.extend_from_slice(&(body.len() as u32).to_be_bytes());
    data.extend_from_slice(&body);
    data
}

#[tokio::test]
async fn discovery_over_udp_session() {
    init_logging();
    let topology = test_topology();

    let mut server = serve(
        "127.0.0.1:0".parse().unwrap(),
        SessionConfig { endpoint_name: "server".into(), ..Default::default() },
    )
    .await
    .unwrap();
    let addr = server.local_addr();

    let responder = TopologyServer::new(topology.clone()).unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let server_task = tokio::spawn(async move {
        let _ = responder.serve(&mut server, cancel_rx).await;
    });

    let mut client = connect(
        addr,
        SessionConfig { endpoint_name: "client".into(), ..Default::default() },
    )
    .await
    .unwrap();

    let discovered = discover(
        &mut client,
        &DiscoveryConfig { quiescence: Duration::from_millis(300), ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(discovered, topology);

    client.shutdown().await.unwrap();
    server_task.abort();
}

#[tokio::test]
async fn smf_playback_reaches_udp_peer_in_order() {
    init_logging();
    let mut server = serve(
        "127.0.0.1:0".parse().unwrap(),
        SessionConfig { endpoint_name: "sink".into(), ..Default::default() },
    )
    .await
    .unwrap();
    let addr = server.local_addr();

    let mut client = connect(
        addr,
        SessionConfig { endpoint_name: "player".into(), ..Default::default() },
    )
    .await
    .unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let data = smf_fixture();
    play_smf(&data, 3, &mut client, cancel_rx).await.unwrap();

    assert_eq!(
        server.recv().await,
        Some(UmpPacket::Midi1(Midi1ChannelVoice::note_on(3, 0, 60, 100)))
    );
    assert_eq!(
        server.recv().await,
        Some(UmpPacket::Midi1(Midi1ChannelVoice::note_off(3, 0, 60, 0)))
    );

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn discovery_over_raw_byte_channel() {
    init_logging();
    let topology = test_topology();

    let (near, far) = tokio::io::duplex(4096);
    let (near_r, near_w) = tokio::io::split(near);
    let (far_r, far_w) = tokio::io::split(far);
    let mut device_side = RawEndpoint::spawn(far_r, far_w);
    let mut host_side = RawEndpoint::spawn(near_r, near_w);

    let responder = TopologyServer::new(topology.clone()).unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let device_task = tokio::spawn(async move {
        let _ = responder.serve(&mut device_side, cancel_rx).await;
    });

    let discovered = discover(
        &mut host_side,
        &DiscoveryConfig { quiescence: Duration::from_millis(100), ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(discovered, topology);
    device_task.abort();
}

#[tokio::test]
async fn config_drives_topology_server() {
    init_logging();
    let config = Config {
        endpoint_name: "Configured".into(),
        product_instance_id: Some("CFG-7".into()),
        function_blocks: vec![FunctionBlock {
            id: 0,
            name: "Keys".into(),
            direction: BlockDirection::Output,
            ui_hint: 0,
            first_group: 0,
            num_groups: 1,
            midi1_mode: Midi1Mode::None,
            is_active: true,
        }],
        ..Config::default()
    };

    let (mut client_side, mut server_side) = channel_pair(64);
    let responder = TopologyServer::new(config.topology()).unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = responder.serve(&mut server_side, cancel_rx).await;
    });

    let discovered = discover(
        &mut client_side,
        &DiscoveryConfig { quiescence: Duration::from_millis(50), ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(discovered.name, "Configured");
    assert_eq!(discovered.product_instance_id, "CFG-7");
    assert_eq!(discovered.function_blocks.len(), 1);
}
