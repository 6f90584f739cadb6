//! MIDI 2.0 Universal MIDI Packet stack: codec, Network MIDI 2.0 UDP
//! transport, raw character-device endpoints, UMP Stream topology
//! discovery, and Standard MIDI File playback.
//!
//! The protocol layers live in the member crates: [`midi2_core`] holds
//! the transport-independent codec and models, [`midi2_network`] the UDP
//! session machinery. This crate ties them to endpoints, discovery,
//! playback, and configuration.

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod player;
pub mod raw;

pub use config::Config;
pub use discovery::{discover, DiscoveryConfig, TopologyServer};
pub use endpoint::{channel_pair, open, ChannelEndpoint, EndpointLocator, UmpEndpoint};
pub use player::{play, play_smf, PlayOutcome};
pub use raw::RawEndpoint;

pub use midi2_core::smf::{SmfFile, TimedPacket};
pub use midi2_core::topology::{EndpointTopology, FunctionBlock};
pub use midi2_core::ump::UmpPacket;
pub use midi2_network::{AuthMethod, SessionConfig, SessionEvent, UdpEndpoint};
