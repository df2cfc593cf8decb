//! Signaling and peer-connection core for the dispatch video call client.
//!
//! A [`CallSessionController`] owns one participant's call: it consumes
//! signaling events from a [`SignalingTransport`], drives offer/answer/ICE
//! exchange per remote participant through the [`PeerConnectionRegistry`], and
//! publishes [`CoreEvent`]s for whatever renders the call.

pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod identity;
pub mod login;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod roster;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus};
pub use handle::{PeerSummary, SessionHandle, SessionSnapshot};
pub use identity::SessionIdentity;
pub use login::{LoginClient, LoginError, LoginSession};
pub use registry::{ConnectionState, PeerConnectionRegistry, PeerConnectionEntry};
pub use roster::{Driver, DriverRoster};
pub use session::{CallSessionController, CallState, IncomingCall, RoomState};
pub use transport::{Inbound, SignalingTransport, Signaler, Subscription};
