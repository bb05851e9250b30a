//! Utility functions and helpers.

mod ids;
mod logging;
mod shutdown;

pub use ids::{generate_request_id, ConnId, RequestId};
pub use logging::init_logging;
pub use shutdown::ShutdownHandle;
