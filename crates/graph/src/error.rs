//! Graph layer errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    /// Transient connectivity failure; retried by the query layer
    #[error("Graph unavailable: {0}")]
    Unavailable(String),

    /// Query rejected or malformed
    #[error("Graph query failed: {0}")]
    Query(String),

    /// A returned record violates a schema invariant (missing id, bad enum)
    #[error("Graph schema violation: {0}")]
    Schema(String),

    /// Rejected out-of-order rewrite of an existing record
    #[error("Stale write rejected: {0}")]
    StaleWrite(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::Unavailable(_))
    }
}

impl From<neo4rs::Error> for GraphError {
    fn from(err: neo4rs::Error) -> Self {
        let text = err.to_string();
        match err {
            neo4rs::Error::ConnectionError => GraphError::Unavailable(text),
            _ => GraphError::Query(text),
        }
    }
}

impl From<GraphError> for cpq_core::Error {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Unavailable(msg) => cpq_core::Error::GraphUnavailable(msg),
            GraphError::Schema(msg) => cpq_core::Error::GraphSchema(msg),
            other => cpq_core::Error::Other(other.to_string()),
        }
    }
}
