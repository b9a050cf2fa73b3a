//! Error taxonomy for an IC run.
//!
//! Startup problems (bad parameters, unknown plugin choices) are reported to
//! the caller, who terminates with a diagnostic. Runtime numerics and I/O
//! failures are also surfaced as errors, but a run is never retried or
//! resumed; restarting is cheaper than recovering. Shape and FFT-state
//! contract violations are programmer errors and panic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcError {
    /// Missing or malformed run parameter.
    #[error("configuration: {0}")]
    Config(String),

    /// Unknown output / RNG / transfer-function choice.
    #[error("plugin selection: {0}")]
    PluginSelection(String),

    /// Non-finite amplitude, vanishing sigma(phi) in the semiclassical path.
    #[error("numeric: {0}")]
    Numeric(String),

    /// Power-spectrum or grid dump write failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
