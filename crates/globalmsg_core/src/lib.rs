pub mod cache;
pub mod config;
pub mod events;
pub mod import;
pub mod language;
pub mod registry;
pub mod runtime;
pub mod shared_sqlite;
pub mod snapshot;
pub mod store;
pub mod title;
pub mod updater;
