//! Protected-server routes and the ban list.
//!
//! The registry holds one immutable [`RegistrySnapshot`] behind an `ArcSwap`.
//! A refresh reads both contracts from the [`RegistrySource`], builds a
//! complete new snapshot off to the side, then publishes it with a single
//! pointer swap. Readers load whichever snapshot is current and never wait on
//! a refresh.
//!
//! If either read fails, the refresh is abandoned and the previous snapshot
//! stays in force.

mod model;
mod snapshot;
mod store;

pub use model::{BanEntry, ProtectedServer, ServerStatus};
pub use snapshot::{RefreshSummary, Registry, RegistrySnapshot, SharedRegistry};
pub use store::{parse_expiry, RegistrySource, SqliteSource, StoreError};

use thiserror::Error;

/// Errors from a registry refresh.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// One of the two store reads failed.
    #[error("failed to load {what}: {source}")]
    Load {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}
