//! ============================================================================
//! pythomnic-core: the cage runtime kernel
//! ============================================================================
//!
//! A `Cage` is one running application-server process: a hot-reloadable
//! module loader, a registry of shared resource pools (database handles, RPC
//! clients, anything connectable and expiring), and a best-effort transaction
//! coordinator that fans a request out to every resource it touches.
//!
//! - `sync`: the writer-priority, deadline-bounded `DeadlineRwLock<T>` every
//!   other module builds on.
//! - `error`: the error taxonomy: `ResourceError`, `CoordinatorError`,
//!   `PoolError`, `ModuleError`.
//! - `request_context`: ambient per-request state: deadline, parameters,
//!   log-level overrides, installed on the handling thread.
//! - `resource`: the `ResourceInstance` trait and its lifecycle state
//!   machine.
//! - `cache`: the optional read/write cache overlaying a resource pool.
//! - `pool`: `ResourcePool`, its background sweeper, and the process-wide
//!   `SharedPoolRegistry`.
//! - `config`: per-resource configuration loaded from
//!   `config_resource_<name>.toml`.
//! - `module_loader`: hot-reloadable dynamic-library modules behind a
//!   stable C-ABI entry point.
//! - `transaction`: the participant worker pools and the best-effort
//!   transaction coordinator.
//! - `cage`: wires all of the above into one process-wide entry point.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pythomnic_core::cage::Cage;
//!
//! let cage = Arc::new(Cage::new(
//!     vec![PathBuf::from("modules")],
//!     PathBuf::from("config"),
//!     Duration::from_secs(10),
//!     Duration::from_secs(30),
//! ));
//! cage.spawn_sweeper();
//! ```

pub mod sync;

pub mod error;
pub use error::{CoordinatorError, ModuleError, PoolError, ResourceError, ResourceInputParameterError, RpcError, SqlResourceError};

pub mod request_context;
pub use request_context::{InstallGuard, RequestContext, RequestContextRecord};

pub mod resource;
pub use resource::{Lifecycle, ResourceInstance, State, TransactionContext};

pub mod cache;
pub use cache::{EvictionPolicy, GetOutcome, ReadWriteCache};

pub mod pool;
pub use pool::{ResourcePool, SharedPoolRegistry, Sweeper};

pub mod config;
pub use config::ResourceConfig;

pub mod module_loader;
pub use module_loader::{Module, ModuleLoader};

pub mod transaction;
pub use transaction::{AcceptDecision, AcceptFn, Participant, ParticipantOutcome, ParticipantWorkerPool, Transaction};

pub mod cage;
pub use cage::{Cage, ResourceFactoryFn};
