//! Checkpoint daemon's server-side networking modules.

mod external;
mod node;
mod transport;

pub use external::{
    ApiReply, ApiRequest, ClientCall, ConnId, ReplyData, RequestKind,
};
pub use node::{ChanCaps, CheckpointNode};
pub use transport::{PeerEvent, TransportHub};

pub(crate) use external::ExternalApi;
