//! Checkpoint state held by one node: section storage, replicas, and the
//! operations in flight against them.

mod operation;
mod replica;
mod section;
mod types;

pub use operation::{
    Advance, OpKind, OpNo, OpPayload, OpState, Operation, Origin, ReadKind,
};
pub use replica::{Mutation, NodeState, Replica};
pub use section::{
    Section, SectionImage, SectionState, SectionStore, UpdateState,
};
pub use types::{
    now_satime, CkptAttributes, CkptError, CkptHandle, CkptResult,
    CkptStatus, ClientHandle, CreationFlags, DataState, NodeName, OpenFlags,
    RequestNo, SaTime, SectionDescriptor, SectionsChosen, Version,
    SUPPORTED_VERSION, TIME_END,
};
