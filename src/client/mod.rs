//! Checkpoint client library: connection stubs and the session API.

mod apistub;
mod session;

pub use apistub::{ClientApiStub, ClientRecvStub, ClientSendStub};
pub use session::{CkptSession, Completion, SectionIter};
