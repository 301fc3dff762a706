//! In-memory directory engine for a versioned, replicated source-code
//! repository server.
//!
//! This crate is the server's core: the packed directory representation
//! and its copy-on-write overlay chains, the 32-bit-pointer memory pool
//! backing them, the transactional journal that makes mutations durable,
//! the checkpoint/compaction machinery, and the reference-counted
//! file-identifier bookkeeping. The RPC dispatcher, the network
//! filesystem adapter, the weeder driver, and the byte-store contents
//! live outside and talk to this crate through the seams re-exported
//! below ([`SidStore`], [`EvaluatorGateway`], [`AccessControl`]).

pub mod access;
pub mod attrib;
pub mod checkpoint;
pub mod copylock;
pub mod dir;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod forward;
pub mod fpindex;
pub mod journal;
pub mod leaf;
pub mod longid;
pub mod pool;
pub mod refcount;
pub mod repository;
pub mod store;
pub mod types;

pub use access::{AccessClass, AccessConfig, AccessControl, Identity};
pub use attrib::AttribOp;
pub use dir::{DirectoryStats, ListEntry, Source};
pub use error::{RepositoryError, Result};
pub use evaluator::{EvalEntry, EvalSession, EvaluatorGateway};
pub use fingerprint::Fingerprint;
pub use journal::Journal;
pub use longid::LongId;
pub use pool::{MemPool, PoolConfig, ShortPtr};
pub use repository::{Lock, LockKind, Repository, RepositoryConfig};
pub use store::{FsStore, SidStore};
pub use types::{DupeCheck, ShortId, SourceKind};
