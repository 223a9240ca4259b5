//! Utility functions and helpers.

mod logging;
mod request_id;
mod shutdown;

pub use logging::init_logging;
pub use request_id::{ensure_trace_id, generate_trace_id, TRACE_HEADER};
pub use shutdown::ShutdownSignal;
