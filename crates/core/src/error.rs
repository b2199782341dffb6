//! Error kinds shared across the control plane.
//!
//! Every failure a caller can observe maps to one of these variants so the
//! embedding API layer can translate them uniformly (see `status_code`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Generation;

pub type BallastResult<T> = Result<T, BallastError>;

/// One invalid object inside a `ValidationError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub generation: Option<Generation>,
    pub message: String,
}

impl fmt::Display for Offender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)?;
        if let Some(gen) = self.generation {
            write!(f, "@{}", gen)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Validation failure carrying the full offender list, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub offenders: Vec<Offender>,
}

impl ValidationError {
    pub fn new() -> ValidationError {
        ValidationError { offenders: Vec::new() }
    }

    pub fn push(&mut self, namespace: &str, kind: &str, name: &str, message: impl Into<String>) {
        self.offenders.push(Offender {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            generation: None,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.offenders.is_empty()
    }

    /// Ok when no offenders were collected.
    pub fn into_result(self) -> BallastResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BallastError::Validation(self))
        }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed ({} offender(s))", self.offenders.len())?;
        for o in &self.offenders {
            write!(f, "\n  - {}", o)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Error kinds suitable for transport across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BallastError {
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("acl denied: user {user} may not manage {key}")]
    AclDenied { user: String, key: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transaction conflict, retry")]
    ConflictRetry,
    #[error("resolution cycle: {chain}")]
    ResolutionCycle { chain: String },
    #[error("no matching context in contract {contract} for claim {claim}")]
    NoMatchingContext { contract: String, claim: String },
    #[error("denied by rule {rule}: {subject}")]
    Denied { rule: String, subject: String },
    #[error("unresolved template {template} at {site}")]
    UnresolvedTemplate { template: String, site: String },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("fatal driver error: {0}")]
    FatalDriver(String),
    #[error("cancelled")]
    Cancelled,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl BallastError {
    /// The HTTP status an API handler reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BallastError::Validation(_) | BallastError::UnresolvedTemplate { .. } => 400,
            BallastError::AclDenied { .. } => 403,
            BallastError::NotFound(_) => 404,
            BallastError::StoreUnavailable(_) | BallastError::Cancelled => 503,
            _ => 500,
        }
    }

    /// Whether a caller-side retry can make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BallastError::ConflictRetry
                | BallastError::Cancelled
                | BallastError::StoreUnavailable(_)
        )
    }
}
