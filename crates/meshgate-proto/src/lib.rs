//! Meshgate Protocol Definitions
//!
//! This crate defines the wire messages, framing codec, routing advertisement
//! types and ingress policy documents shared by gateways and providers.

pub mod channel_id;
pub mod codec;
pub mod fingerprint;
pub mod ingress;
pub mod message;
pub mod peer_key;
pub mod routing;

pub use channel_id::{ChannelIdAllocator, ChannelIdError};
pub use codec::{CodecError, FrameCodec};
pub use fingerprint::{ChannelFingerprint, Endpoint};
pub use ingress::{BandwidthLimit, IngressPolicy, IngressRule, PolicyError, PortRange};
pub use message::{Action, Message};
pub use peer_key::PeerKey;
pub use routing::{AdvertisedService, Protocol, RouteAdvertisement, Service, ServiceKey};

/// Channel identifier within one gateway/session
pub type ChannelId = u32;

/// Maximum frame payload size (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a single stream fragment (1MB)
pub const MAX_STREAM_CHUNK: usize = 1024 * 1024;

/// Channel id meaning "every channel of this peer" in a `close`
pub const CLOSE_ALL: ChannelId = 0;
