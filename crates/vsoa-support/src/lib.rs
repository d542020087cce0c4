pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{ErrorUtils, VsoaError, VsoaErrorKind, VsoaResult};
