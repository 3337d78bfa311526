//! Connection dispatch.
//!
//! [`Dispatcher`] holds the round-robin rotation and the bounded wait queue;
//! [`DispatchService`] owns the public listening socket and proxies each
//! accepted connection to the worker the dispatcher picks.

mod rotation;
mod service;

pub use rotation::{ConnectionEvent, Dispatch, Dispatcher, Rejected};
pub use service::DispatchService;

use crate::pool::WorkerId;

/// A Ready worker and the private endpoint it serves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: WorkerId,
    pub endpoint: String,
}
