//! The Network MIDI 2.0 UDP transport: command codec, authentication,
//! session state machine, and the socket-owning session loops.

pub mod auth;
pub mod command;
pub mod endpoint;
pub mod session;

pub use auth::AuthMethod;
pub use command::{ByeReason, Command, CommandError, NakReason};
pub use endpoint::{connect, serve, UdpEndpoint};
pub use session::{
    Session, SessionConfig, SessionError, SessionEvent, SessionOutput, SessionRole, SessionState,
};
