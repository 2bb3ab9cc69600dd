//! Development adapters for the engine's ports.

pub mod dry_run;
pub mod in_memory;
pub mod json_file;
pub mod notifier;

pub use dry_run::DryRunProvider;
pub use in_memory::InMemoryLeadSource;
pub use json_file::JsonFileLeadSource;
pub use notifier::LogNotifier;
