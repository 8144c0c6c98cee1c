mod error;
mod memory;
pub mod models;
mod pool;
pub mod repositories;
mod sqlite;
mod store;

pub use error::*;
pub use memory::InMemoryStore;
pub use pool::*;
pub use repositories::*;
pub use sqlite::SqliteStore;
pub use store::Store;
