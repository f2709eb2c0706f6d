use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {uid}: not found")]
    NotFound { kind: &'static str, uid: String },

    #[error("{kind} {uid}: already exists")]
    AlreadyExists { kind: &'static str, uid: String },

    #[error("{kind} {uid}: generation mismatch (expected {expected}, actual {actual})")]
    Conflict {
        kind: &'static str,
        uid: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {uid}: {source}")]
    Io {
        kind: &'static str,
        uid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} {uid}: corrupt record: {source}")]
    Corrupt {
        kind: &'static str,
        uid: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
