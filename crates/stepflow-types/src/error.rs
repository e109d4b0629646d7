use thiserror::Error;
use uuid::Uuid;

/// Errors from execution store operations (used by trait definitions in
/// stepflow-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let id = Uuid::now_v7();
        let err = StoreError::NotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
