//! Session store for the CPQ engine
//!
//! A typed wrapper over the [`SessionGraph`] backend. The backend enforces
//! merge-only writes and sibling sync; this layer adds what the graph cannot
//! know:
//! - housing dimension mapping and depth→length derivation from the tenant
//!   tables, applied before the upsert so the persisted tag is already
//!   derived;
//! - per-session write serialization (one turn at a time per session);
//! - turn numbering guards and message truncation;
//! - the background TTL sweeper.

pub mod store;

pub use store::{SessionLockGuard, SessionStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Graph(#[from] cpq_graph::GraphError),

    /// A concurrent turn held the session lock past the wait threshold
    #[error("Session {session_id} is busy with another turn")]
    LockConflict { session_id: String },
}

impl From<SessionError> for cpq_core::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Graph(g) => g.into(),
            SessionError::LockConflict { session_id } => {
                cpq_core::Error::SessionLockConflict { session_id }
            }
        }
    }
}
