pub mod booking;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod idempotency;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweep;
pub mod wal;
