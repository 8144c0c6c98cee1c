mod event_repository;
mod task_config_repository;

pub use event_repository::*;
pub use task_config_repository::*;
