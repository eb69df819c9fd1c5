// Library root: re-exports all modules so integration tests and the
// `gavel-live` binary share one public API.

pub mod auction;
pub mod config;
pub mod db;
pub mod import;
pub mod mirror;
pub mod store;
pub mod sync;
