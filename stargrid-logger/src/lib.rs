//! Logging bootstrap for Stargrid services and tools.
//!
//! Builds a `tracing-subscriber` registry from a small [`LogConfig`]:
//! plain or JSON output, to stdout or a file.

pub mod logging;

pub use logging::{init, LogConfig, LogFormat, LogOutput};
