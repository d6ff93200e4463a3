//! Persisted record store, ordered indices, interning and job coordination for a
//! source code search index.

#[macro_use]
extern crate tracing;

pub mod btree;
pub mod config;
pub mod db;
pub mod field;
pub mod intern;
pub mod job;
pub mod log;
pub mod names;
pub mod session;

pub use db::Database;
pub use session::Session;
