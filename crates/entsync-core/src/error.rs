//! Error types for entsync operations.

use std::fmt;

/// The primary error type for all entsync operations.
#[derive(Debug)]
pub enum Error {
    /// A registry operation was attempted outside an open transaction
    NoActiveTransaction,
    /// A store with a different transaction-manager key joined a transaction
    StoreConflict(StoreConflictError),
    /// Illegal lifecycle transition
    Lifecycle(LifecycleViolation),
    /// Unique constraint violated in the underlying session
    UniqueConstraintViolation {
        /// Constraint name extracted from the session message
        constraint: String,
        /// Original session message
        message: String,
    },
    /// A change was detected in a read-only transaction
    ReadOnlyViolation {
        /// Entity type of the first offending instance
        entity: String,
    },
    /// Attribute metadata is missing or malformed
    Metadata(MetadataError),
    /// A `Deny` delete policy blocked a soft delete
    DeletePolicyViolation {
        entity: String,
        attribute: String,
        related: usize,
    },
    /// A single-result load found more than one row
    NonUniqueResult {
        entity: String,
        count: usize,
    },
    /// The pre-commit traversal did not reach a fixed point
    FlushLimitExceeded {
        iterations: usize,
    },
    /// Error raised by the underlying ORM session
    Persistence(PersistenceError),
    /// Configuration errors
    Config(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StoreConflictError {
    pub store: String,
    pub expected_manager: String,
    pub actual_manager: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleViolation {
    pub kind: LifecycleViolationKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleViolationKind {
    /// Primary key of a removed or already-persisted entity was changed
    IdentityChange,
    /// `mark_removed` on an entity that is not managed
    NotManaged,
    /// Entity is already managed by another transaction
    ForeignTransaction,
    /// Operation on an entity whose state does not allow it
    InvalidState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataError {
    pub entity: String,
    pub attribute: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Row or store not found
    NotFound,
    /// Optimistic/pessimistic lock conflict
    Lock,
    /// Session already closed or in an unusable state
    Session,
    /// Query text could not be processed
    Query,
    /// Other back-end error
    Backend,
}

impl Error {
    /// Does this error indicate a broken invariant that must abort the transaction?
    ///
    /// Request-scoped failures (metadata, unique constraints, delete policies,
    /// non-unique results) leave the transaction usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NoActiveTransaction
                | Error::StoreConflict(_)
                | Error::Lifecycle(_)
                | Error::ReadOnlyViolation { .. }
                | Error::FlushLimitExceeded { .. }
        )
    }

    /// Constraint name of a unique violation, if this is one.
    pub fn constraint_name(&self) -> Option<&str> {
        match self {
            Error::UniqueConstraintViolation { constraint, .. } => Some(constraint),
            _ => None,
        }
    }

    pub fn lifecycle(
        kind: LifecycleViolationKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Lifecycle(LifecycleViolation {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }

    pub fn metadata(
        entity: impl Into<String>,
        attribute: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Metadata(MetadataError {
            entity: entity.into(),
            attribute: attribute.map(str::to_string),
            message: message.into(),
        })
    }
}

impl PersistenceError {
    pub fn new(kind: PersistenceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Is this a constraint violation?
    pub fn is_constraint(&self) -> bool {
        self.kind == PersistenceErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoActiveTransaction => write!(f, "No active transaction"),
            Error::StoreConflict(e) => write!(f, "Store conflict: {}", e),
            Error::Lifecycle(e) => write!(f, "Lifecycle violation: {}", e),
            Error::UniqueConstraintViolation { constraint, .. } => {
                write!(f, "Unique constraint violation: {}", constraint)
            }
            Error::ReadOnlyViolation { entity } => write!(
                f,
                "Modification in read-only transaction (entity {})",
                entity
            ),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::DeletePolicyViolation {
                entity,
                attribute,
                related,
            } => write!(
                f,
                "Cannot delete {}: '{}' still references {} entit{}",
                entity,
                attribute,
                related,
                if *related == 1 { "y" } else { "ies" }
            ),
            Error::NonUniqueResult { entity, count } => write!(
                f,
                "Expected a single {} but the query returned {} rows",
                entity, count
            ),
            Error::FlushLimitExceeded { iterations } => write!(
                f,
                "Flush did not settle after {} iterations",
                iterations
            ),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for StoreConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "store '{}' uses transaction manager '{}' but the transaction is bound to '{}'",
            self.store, self.actual_manager, self.expected_manager
        )
    }
}

impl fmt::Display for LifecycleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.entity)
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(attr) = &self.attribute {
            write!(f, "{}.{}: {}", self.entity, attr, self.message)
        } else {
            write!(f, "{}: {}", self.entity, self.message)
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<LifecycleViolation> for Error {
    fn from(err: LifecycleViolation) -> Self {
        Error::Lifecycle(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

impl From<StoreConflictError> for Error {
    fn from(err: StoreConflictError) -> Self {
        Error::StoreConflict(err)
    }
}

/// Result type alias for entsync operations.
pub type Result<T> = std::result::Result<T, Error>;
