//! Infrastructure layer: authorization stores, configuration, background jobs.

pub mod config;
pub mod store;
pub mod sweeper;


pub use config::{ConfigError, StaybaseConfig};
pub use store::{DirectoryUser, InMemoryAuthorizationStore, PostgresAuthorizationStore};
pub use sweeper::{InvitationSweeper, SweeperHandle};
