//! Command-line arguments and persisted configuration for sita.
//!
//! [`Cli`] is the clap surface of the `sita` binary; [`Configuration`] is the
//! explicit settings object loaded from the SQLite key/value store at startup,
//! mutated only through [`Configuration::set`], and re-persisted on change.

pub mod cli_args;
pub mod cli_types;
pub mod configuration;
pub mod settings_store;

pub use cli_args::Cli;
pub use cli_types::*;
pub use configuration::*;
pub use settings_store::SettingsStore;
