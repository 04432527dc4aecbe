pub mod error_logging;

pub use error_logging::{ErrorLogging, cause_chain};
