//! Graph query surface for the CPQ engine
//!
//! This crate is the portability boundary between the reasoning engine and
//! the knowledge graph. The engine depends only on the `GraphReader` and
//! `SessionGraph` traits; any labeled property graph that can answer these
//! typed operations is an acceptable backend.
//!
//! Two backends ship here:
//! - [`Neo4jGraph`]: production backend over the Bolt protocol (`neo4rs`).
//!   Conditional linking is expressed as separate find + link queries, never
//!   vendor-specific conditional subqueries.
//! - [`MemoryGraph`]: an in-memory labeled property graph used by the test
//!   suite and for cold-start development without a database.

pub mod error;
pub mod fixture;
pub mod memory;
pub mod neo4j;
pub mod reader;
pub mod retry;
pub mod rows;
pub mod session;

pub use error::{GraphError, GraphResult};
pub use memory::MemoryGraph;
pub use neo4j::Neo4jGraph;
pub use reader::GraphReader;
pub use retry::RetryPolicy;
pub use rows::*;
pub use session::{ProjectRow, ProjectState, SessionGraph, SessionGraphData, TagRow, TurnRow};

/// Normalize a product family reference to its node id (`FAM_…`)
pub fn family_id(family: &str) -> String {
    if family.starts_with("FAM_") {
        family.to_string()
    } else {
        format!("FAM_{}", family.to_uppercase())
    }
}

/// Short family name from a node id (`FAM_GDB` → `GDB`)
pub fn family_short_name(family_id: &str) -> &str {
    family_id.strip_prefix("FAM_").unwrap_or(family_id)
}

/// Current wall-clock time in epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_id_normalization() {
        assert_eq!(family_id("GDB"), "FAM_GDB");
        assert_eq!(family_id("gdb"), "FAM_GDB");
        assert_eq!(family_id("FAM_GDB"), "FAM_GDB");
        assert_eq!(family_short_name("FAM_GDB"), "GDB");
        assert_eq!(family_short_name("GDB"), "GDB");
    }
}
