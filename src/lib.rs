//! oxiparam - a distributed key-value parameter service core
//!
//! Worker processes push vector-valued parameter updates to a pool of server
//! processes and pull them back, with keys partitioned across servers. The
//! request machinery is asynchronous and zero-copy friendly: a worker may
//! fire many outstanding pushes and pulls and wait on their timestamps.
//!
//! # Data flow
//!
//! ```text
//! caller → KvWorker::pull → slicer → per-shard Message → Transport::send
//!                                                             ↓
//!                                               remote KvServer handler
//!                                                             ↓
//!                                              Transport → KvWorker
//!                                                             ↓
//!                                 Customer counts the response; on the last
//!                                 one the fragments merge back into caller
//!                                 key order and the callback fires
//! ```
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use oxiparam::post::{InprocNetwork, Postoffice, Role};
//! use oxiparam::server::{KvServer, KvStoreHandle};
//! use oxiparam::slicer::SlicerPolicy;
//! use oxiparam::worker::KvWorker;
//!
//! let net = InprocNetwork::new();
//! let server_po = Postoffice::new(Role::Server, 0, 1, 1, 100, 0);
//! let worker_po = Postoffice::new(Role::Worker, 0, 1, 1, 100, 0);
//! net.add_node(&server_po).unwrap();
//! net.add_node(&worker_po).unwrap();
//!
//! let store = KvStoreHandle::<f32>::new();
//! let _server = KvServer::new(0, server_po, store.handler()).unwrap();
//! let worker = KvWorker::new(0, 0, SlicerPolicy::Range, worker_po).unwrap();
//!
//! let ts = worker.push(&[1, 3], &[1.0, 3.0], &[], 0, None).unwrap();
//! worker.wait(ts);
//! let ts = worker.pull(&[1, 3], 0, None).unwrap();
//! let out = worker.wait_pull(ts).unwrap();
//! assert_eq!(out.vals.as_slice(), &[1.0, 3.0]);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod customer;
pub mod kv;
pub mod message;
pub mod post;
pub mod range;
pub mod sarray;
pub mod server;
pub mod slicer;
pub mod status;
pub mod worker;

// Re-exports for convenience
pub use kv::{Key, KvMeta, KvPairs, Len, Timestamp};
pub use sarray::SArray;
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes; all shared array storage is aligned
    /// to it so element-granular segments of any primitive stay aligned.
    pub const CACHE_LINE_BYTES: usize = 64;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::OxiparamConfig;
    pub use crate::kv::{Key, KvMeta, KvPairs, Len, Timestamp};
    pub use crate::post::{InprocNetwork, Postoffice, Role, Transport};
    pub use crate::range::Range;
    pub use crate::sarray::SArray;
    pub use crate::server::{KvServer, KvStoreHandle, ServerHandle};
    pub use crate::slicer::{SlicerPolicy, Sliced, SlicerFn};
    pub use crate::status::Status;
    pub use crate::worker::KvWorker;
}
