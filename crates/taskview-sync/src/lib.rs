//! Live task view: pulls the event log and task snapshot over HTTP, listens
//! on the push channel, and folds everything into one consistent store.

pub mod config;
pub mod dispatch;
pub mod health;
pub mod lazy_cache;
pub mod ledger;
pub mod liveness;
pub mod normalizer;
pub mod push;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{read_config_file, ConfigError, SyncConfig};
pub use dispatch::Outbound;
pub use runtime::{run_view, spawn_view, ViewHandle, ViewUpdate};
pub use session::{CommandRejected, UserCommand, ViewSession};
pub use store::{ChangeKind, ViewSnapshot};
pub use transport::{ApiError, HttpTaskApi, HttpTaskApiConfig, TaskApi};
