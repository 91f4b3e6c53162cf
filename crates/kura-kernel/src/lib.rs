//! # kura-kernel
//!
//! A virtual filesystem that aggregates storage backends under one tree.
//!
//! Backends are mounted at virtual paths. Several backends sharing a mount
//! path (via the `.balance` suffix) form a group that is resolved round-robin.
//! Listings and links are cached per mount, with concurrent misses coalesced
//! into a single backend call. Cross-mount copies run as a tree of
//! cancellable tasks on a bounded task engine.

pub mod backend;
pub mod backends;
pub mod cache;
pub mod config;
pub mod context;
pub mod copy;
pub mod error;
pub mod fs;
pub mod ids;
pub mod kernel;
pub mod mount;
pub mod ops;
pub mod path;
pub mod search;
pub mod sign;
pub mod tasks;
pub mod types;

pub use backend::{RootFolderId, RootFolderPath, StorageBackend};
pub use backends::{DriverRegistry, LocalBackend, MemoryBackend};
pub use cache::CoalescingCache;
pub use config::{ConfigError, KuraConfig, MountConfig};
pub use context::OpContext;
pub use copy::{CopyJob, CopyOrchestrator, CopySummary};
pub use error::{StorageError, StorageResult};
pub use fs::{CopyOutcome, Fs};
pub use ids::{JobId, TaskId};
pub use kernel::Kernel;
pub use mount::{Mount, MountId, MountRegistry, Resolved};
pub use ops::Ops;
pub use search::{Indexer, MemoryIndex, SearchNode, SearchSlot};
pub use sign::{KeyedSigner, SignError, Signer, SignerSlot};
pub use tasks::{Task, TaskContext, TaskError, TaskHandle, TaskManager, TaskState};
pub use types::{DriverConfig, FileStream, Link, LinkArgs, Object};
