pub mod config;
pub mod event;
pub mod task;

pub use config::*;
pub use event::*;
pub use task::*;
