// ============================================================================
// File: packages/core/src/error.rs
// ----------------------------------------------------------------------------
// Error taxonomy for the cage runtime kernel. One enum per concern, composed
// with #[from]/explicit From impls rather than a single god-enum.
// ============================================================================

use thiserror::Error;

/// A call against a resource failed.
///
/// `recoverable = true` means no irreversible side effects happened and the
/// caller may retry; `terminal = true` means the instance that produced this
/// error must be discarded from its pool.
#[derive(Debug, Clone, Error)]
#[error("resource error: {description}")]
pub struct ResourceError {
    pub code: Option<i32>,
    pub description: String,
    pub recoverable: bool,
    pub terminal: bool,
    pub participant_index: Option<usize>,
}

impl ResourceError {
    pub fn new(description: impl Into<String>, recoverable: bool, terminal: bool) -> Self {
        Self {
            code: None,
            description: description.into(),
            recoverable,
            terminal,
            participant_index: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_participant(mut self, index: usize) -> Self {
        self.participant_index = Some(index);
        self
    }

    /// Wrap an opaque error that escaped a participant call. Per the
    /// propagation policy this is always non-recoverable and terminal.
    pub fn wrap_unknown(err: impl std::fmt::Display, in_transaction: bool) -> Self {
        Self::new(err.to_string(), !in_transaction, true)
    }
}

/// `ResourceError` with an attached SQL state code.
#[derive(Debug, Clone, Error)]
#[error("sql resource error ({sql_state}): {inner}")]
pub struct SqlResourceError {
    #[source]
    pub inner: ResourceError,
    pub sql_state: String,
}

/// A remote cage propagated an exception across an RPC hop.
#[derive(Debug, Clone, Error)]
#[error("rpc error: {description}")]
pub struct RpcError {
    pub description: String,
}

/// Caller passed invalid arguments; the call never executed.
/// Guaranteed recoverable and terminal (nothing was touched).
#[derive(Debug, Clone, Error)]
#[error("invalid input parameters: {0}")]
pub struct ResourceInputParameterError(pub String);

/// Errors raised by the `TransactionCoordinator` itself, as opposed to by a
/// participant resource.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Sql(#[from] SqlResourceError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    InputParameter(#[from] ResourceInputParameterError),

    /// Transaction never reached commit: timeout waiting for an
    /// intermediate result, or `accept` rejected all results.
    #[error("transaction execution failed: {reason}")]
    TransactionExecution {
        participant_index: Option<usize>,
        reason: String,
    },

    /// Transaction decided to commit but a participant failed to commit.
    #[error("transaction commit failed for participant {participant_index}")]
    TransactionCommit { participant_index: usize },
}

impl CoordinatorError {
    pub fn participant_index(&self) -> Option<usize> {
        match self {
            Self::Resource(e) => e.participant_index,
            Self::Sql(e) => e.inner.participant_index,
            Self::Rpc(_) => None,
            Self::InputParameter(_) => None,
            Self::TransactionExecution { participant_index, .. } => *participant_index,
            Self::TransactionCommit { participant_index } => Some(*participant_index),
        }
    }
}

/// Errors raised while allocating resources from a pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("resource pool '{0}' is empty")]
    Empty(String),

    #[error("resource pool '{0}' is stopped")]
    Stopped(String),

    #[error("resource factory failed: {0}")]
    FactoryFailed(String),
}

/// Errors raised by the module loader.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("attribute '{attr}' is not exported by module '{module}'")]
    NotExported { module: String, attr: String },

    #[error("attribute '{attr}' is private in module '{module}'")]
    Private { module: String, attr: String },

    #[error("failed to load module '{module}': {reason}")]
    LoadFailed { module: String, reason: String },

    #[error("module '{0}' is missing the end-of-file sentinel")]
    MissingSentinel(String),

    #[error("timed out waiting for module '{0}' lock")]
    LockTimeout(String),

    #[error("module call failed: {0}")]
    CallFailed(String),
}
