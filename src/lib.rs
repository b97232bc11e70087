pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod index;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod status;
pub mod store;
pub mod sweeper;
pub mod sync;
pub mod wal;
