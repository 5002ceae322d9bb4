//! Session layer shared by gateways and providers
//!
//! A [`Peer`] joins the router topic on a swarm, authenticates every
//! connection with a hello handshake and dispatches decoded messages to
//! registered handlers and to its owner's [`PeerHooks`].

pub mod handlers;
pub mod peer;
pub mod ratelimit;
pub mod sinks;

pub use handlers::HandlerList;
pub use peer::{Peer, PeerConfig, PeerError, PeerHooks, Session, REFRESH_INTERVAL};
pub use ratelimit::{RateLimiter, RateLimiterStats};
pub use sinks::{FingerprintRegistration, FingerprintSink, PolicyOverrides};
