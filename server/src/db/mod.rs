//! PostgreSQL persistence for the hosted database.

mod journal;
mod pool;

pub use journal::*;
pub use pool::*;
