//! Public interface to the checkpointd core library, linked by the daemon
//! executable, the client REPL, and the in-memory cluster tests.

#[macro_use]
mod utils;

mod client;
mod server;
mod service;
mod store;

// Helper utilities, functions, and macros
pub use crate::utils::{
    logger_init, CheckpointdError, Timer, TimerWheel, ME,
};

// Checkpoint state and client-visible types
pub use crate::store::{
    now_satime, CkptAttributes, CkptError, CkptHandle, CkptResult,
    CkptStatus, ClientHandle, CreationFlags, DataState, NodeName, OpenFlags,
    NodeState, Replica, RequestNo, SaTime, SectionDescriptor, SectionStore,
    SectionsChosen, Version, SUPPORTED_VERSION, TIME_END,
};

// Protocol engine
pub use crate::service::{
    CkptMessage, Client, ClientChannel, ClusterTransport, FieldMsg,
    OpenCheckpoint, Opener, Service, ServiceConfig, Subtype, Target,
};

// Server-side networking
pub use crate::server::{
    ApiReply, ApiRequest, ChanCaps, CheckpointNode, ClientCall, ConnId,
    ReplyData, RequestKind,
};

// Client-side library
pub use crate::client::{CkptSession, Completion, SectionIter};
