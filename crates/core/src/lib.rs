pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
