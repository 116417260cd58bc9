//! Out-of-band plumbing: configuration files and endpoint exchange.

mod config;
mod connecter;

pub use config::{BenchConfig, ConfigFileError};
pub use connecter::{ConnectError, Connecter};
