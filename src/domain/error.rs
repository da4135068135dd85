use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("unknown report `{key}`")]
    UnknownReport { key: String },
}

impl DomainError {
    pub fn unknown_report(key: impl Into<String>) -> Self {
        Self::UnknownReport { key: key.into() }
    }
}
