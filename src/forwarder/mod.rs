//! TCP and UDP forwarding over the configured listener rules.

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use crate::identity::PendingBuffer;
use crate::notify::Aggregator;

/// Shared collaborators every forwarder task needs, independent of which
/// listener rule it's running.
pub struct ForwarderContext {
    /// Whether the control endpoint (and therefore identity correlation)
    /// is enabled. Mirrors `Config::use_rest_api`.
    pub correlation_mode: bool,
    pub pending: Arc<PendingBuffer>,
    pub aggregator: Arc<Aggregator>,
}
