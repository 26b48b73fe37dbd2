//! # mp-core: The "Merge" of mergeproxy
//!
//! Presents several independent log-search backends as one. A caller asks
//! one logical question and gets one answer, as if a single backend held
//! the union of all the data.
//!
//! - [`KWayMerger`]: lazy merge of N ascending sources into one.
//! - [`Backend`]: the capability every backend adapter implements.
//! - [`MergeProxy`]: fans each operation out to every backend and combines
//!   the answers (union, sum, or bounded k-way merge).

pub mod backend;
pub mod error;
pub mod merge;
pub mod model;
pub mod proxy;

pub use backend::Backend;
pub use error::{Error, ErrorKind, Result};
pub use merge::{KWayMerger, Producer};
pub use model::{
    Credentials, ExcludedBackend, Federated, InvalidRecord, LogRecord, Query, SessionState,
    DEFAULT_LIMIT, DEFAULT_OFFSET, PROCESSED_TIMESTAMP,
};
pub use proxy::{FailurePolicy, MergeProxy, ProxySettings};
