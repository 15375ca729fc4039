//! Checkpoint attribute, flag, and status types shared by the engine, the
//! wire protocol, and the client library.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Cluster node name.
pub type NodeName = String;

/// Per-node handle of an initialized client.
pub type ClientHandle = u32;

/// Per-node handle of an open checkpoint.
pub type CkptHandle = u32;

/// Client-chosen request sequence number.
pub type RequestNo = u32;

/// Time value in nanoseconds.
pub type SaTime = i64;

/// Time value meaning "never".
pub const TIME_END: SaTime = i64::MAX;

/// Current wall-clock time as an `SaTime`.
pub fn now_satime() -> SaTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(TIME_END))
}

/// Client-visible error codes, mirroring the SAF error space.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum CkptError {
    BadHandle,
    InvalidParam,
    Exist,
    NotExist,
    Access,
    Timeout,
    Busy,
    /// The node asked is not (yet) the active one; ask again later.
    TryAgain,
    NoMemory,
    FailedOperation,
    Version,
}

impl fmt::Display for CkptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CkptError::BadHandle => "SA_ERR_BAD_HANDLE",
            CkptError::InvalidParam => "SA_ERR_INVALID_PARAM",
            CkptError::Exist => "SA_ERR_EXIST",
            CkptError::NotExist => "SA_ERR_NOT_EXIST",
            CkptError::Access => "SA_ERR_ACCESS",
            CkptError::Timeout => "SA_ERR_TIMEOUT",
            CkptError::Busy => "SA_ERR_BUSY",
            CkptError::TryAgain => "SA_ERR_TRY_AGAIN",
            CkptError::NoMemory => "SA_ERR_NO_MEMORY",
            CkptError::FailedOperation => "SA_ERR_FAILED_OPERATION",
            CkptError::Version => "SA_ERR_VERSION",
        };
        write!(f, "{}", s)
    }
}

/// Result type of engine-level checkpoint operations.
pub type CkptResult<T> = Result<T, CkptError>;

/// Checkpoint update policy chosen at creation time.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum CreationFlags {
    /// Every update is applied on all replicas through two-phase commit.
    WriteAllReplicas,
    /// Updates commit on the active replica and are pushed to standbys
    /// without acknowledgement.
    WriteActiveReplica,
    /// Same propagation as `WriteActiveReplica`.
    WriteActiveReplicaWeak,
}

impl CreationFlags {
    /// Whether updates bypass two-phase commit.
    pub fn active_only(&self) -> bool {
        !matches!(self, CreationFlags::WriteAllReplicas)
    }
}

/// Open mode flags.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Default, Serialize, Deserialize,
)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub colocated: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        colocated: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        colocated: false,
    };

    pub const COLOCATED: OpenFlags = OpenFlags {
        read: false,
        write: false,
        colocated: true,
    };

    /// Union of two flag sets.
    pub const fn with(self, other: OpenFlags) -> OpenFlags {
        OpenFlags {
            read: self.read || other.read,
            write: self.write || other.write,
            colocated: self.colocated || other.colocated,
        }
    }
}

/// Checkpoint creation attributes; all but the retention duration are fixed
/// for the checkpoint's lifetime and must match on every re-open.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CkptAttributes {
    pub creation_flags: CreationFlags,

    /// Maximum total size of all sections' data.
    pub checkpoint_size: u64,

    /// How long the checkpoint survives its last close.
    pub retention: SaTime,

    pub max_sections: u32,
    pub max_section_size: u64,
    pub max_section_id_size: u32,
}

impl CkptAttributes {
    /// Whether `other` is compatible with these attributes for a re-open.
    /// Retention is not compared since it may be changed after creation.
    pub fn matches(&self, other: &CkptAttributes) -> bool {
        self.creation_flags == other.creation_flags
            && self.checkpoint_size == other.checkpoint_size
            && self.max_sections == other.max_sections
            && self.max_section_size == other.max_section_size
            && self.max_section_id_size == other.max_section_id_size
    }
}

/// Section data validity.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum DataState {
    Valid,
    Corrupted,
}

/// Section selection criteria for queries.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum SectionsChosen {
    Forever,
    LeqExpiration,
    GeqExpiration,
    Corrupted,
    Any,
}

/// Externally visible description of one section.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SectionDescriptor {
    pub id: Vec<u8>,
    pub expiration: SaTime,
    pub size: u64,
    pub data_state: DataState,
    pub last_update: SaTime,
}

/// Checkpoint status as returned by status-get.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CkptStatus {
    pub attrs: CkptAttributes,
    pub number_of_sections: u32,
    pub memory_used: u64,
}

/// Client library interface version.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct Version {
    pub release_code: char,
    pub major: u8,
    pub minor: u8,
}

/// Interface version implemented by this daemon.
pub const SUPPORTED_VERSION: Version = Version {
    release_code: 'A',
    major: 1,
    minor: 1,
};

/// Minor version value meaning "any minor version".
const MINOR_WILDCARD: u8 = 0xff;

impl Version {
    /// Whether two versions are compatible. A minor version of `0xff` on
    /// either side matches any minor version.
    pub fn compatible(&self, other: &Version) -> bool {
        self.release_code == other.release_code
            && self.major == other.major
            && (self.minor == MINOR_WILDCARD
                || other.minor == MINOR_WILDCARD
                || self.minor == other.minor)
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    fn attrs() -> CkptAttributes {
        CkptAttributes {
            creation_flags: CreationFlags::WriteAllReplicas,
            checkpoint_size: 1000,
            retention: 5_000_000_000,
            max_sections: 4,
            max_section_size: 100,
            max_section_id_size: 8,
        }
    }

    #[test]
    fn attrs_match_ignores_retention() {
        let a = attrs();
        let mut b = attrs();
        b.retention = TIME_END;
        assert!(a.matches(&b));
        b.max_section_size = 101;
        assert!(!a.matches(&b));
        let mut c = attrs();
        c.creation_flags = CreationFlags::WriteActiveReplica;
        assert!(!a.matches(&c));
    }

    #[test]
    fn version_compat() {
        let mut v = SUPPORTED_VERSION;
        assert!(v.compatible(&SUPPORTED_VERSION));
        v.minor = 0xff;
        assert!(v.compatible(&SUPPORTED_VERSION));
        v.minor = 2;
        assert!(!v.compatible(&SUPPORTED_VERSION));
        v = SUPPORTED_VERSION;
        v.release_code = 'B';
        assert!(!v.compatible(&SUPPORTED_VERSION));
    }

    #[test]
    fn open_flags_union() {
        let f = OpenFlags::READ.with(OpenFlags::WRITE);
        assert!(f.read && f.write && !f.colocated);
        assert!(!CreationFlags::WriteAllReplicas.active_only());
        assert!(CreationFlags::WriteActiveReplicaWeak.active_only());
    }
}
