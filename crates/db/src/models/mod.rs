mod event;
mod task_config;

pub use event::*;
pub use task_config::*;
