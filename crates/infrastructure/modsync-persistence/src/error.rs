#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state document read failed: {0}")]
    Read(std::io::Error),
    #[error("state document parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("state document is from a newer schema (version={found}, supported={supported})")]
    NewerSchema { found: u32, supported: u32 },
    #[error("state document write failed: {0}")]
    Write(std::io::Error),
    #[error("state mutation failed: {0}")]
    Mutation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Read,
    Parse,
    NewerSchema,
    Write,
    Mutation,
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::Read(_) => StoreErrorKind::Read,
            StoreError::Parse(_) => StoreErrorKind::Parse,
            StoreError::NewerSchema { .. } => StoreErrorKind::NewerSchema,
            StoreError::Write(_) => StoreErrorKind::Write,
            StoreError::Mutation(_) => StoreErrorKind::Mutation,
        }
    }
}
