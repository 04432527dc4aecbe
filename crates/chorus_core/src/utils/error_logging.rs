//! Error formatting for tracing output
//!
//! miette's `Debug` rendering is what we want in logs, but tracing only sees
//! the top-level message unless the source chain is walked explicitly.

use std::error::Error;
use std::fmt::Write;

/// Log an error at ERROR level using its `Debug` (miette) rendering.
#[macro_export]
macro_rules! log_error {
    ($err:expr) => {{
        tracing::error!("{:?}", &$err);
    }};
    ($msg:expr, $err:expr) => {{
        tracing::error!("{}: {:?}", $msg, &$err);
    }};
}

/// Like [`log_error!`] but also logs every `source()` below the error.
#[macro_export]
macro_rules! log_error_chain {
    ($err:expr) => {{
        let err = &$err;
        tracing::error!("{:?}", err);
        for (depth, cause) in $crate::utils::error_logging::cause_chain(err).iter().enumerate() {
            tracing::error!("  caused by {}: {}", depth + 1, cause);
        }
    }};
    ($msg:expr, $err:expr) => {{
        let err = &$err;
        tracing::error!("{}: {:?}", $msg, err);
        for (depth, cause) in $crate::utils::error_logging::cause_chain(err).iter().enumerate() {
            tracing::error!("  caused by {}: {}", depth + 1, cause);
        }
    }};
}

/// Messages of every error below `err`, outermost first.
pub fn cause_chain(err: &dyn Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}

pub trait ErrorLogging {
    /// Single string with the error and its numbered causes
    fn log_format(&self) -> String;
}

impl<E: Error> ErrorLogging for E {
    fn log_format(&self) -> String {
        let mut output = self.to_string();
        let chain = cause_chain(self);
        if !chain.is_empty() {
            output.push_str("\n\nCaused by:");
            for (depth, cause) in chain.iter().enumerate() {
                let _ = write!(output, "\n  {}: {}", depth + 1, cause);
            }
        }
        output
    }
}
