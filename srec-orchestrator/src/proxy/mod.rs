//! Egress proxy pool with health tracking and failover selection.

pub mod probe;
pub mod registry;

pub use probe::{HttpProxyProber, ProbeOutcome, ProxyProber};
pub use registry::{
    Egress, ProxyEntry, ProxyHealth, ProxyHealthRegistry, ProxyPoolConfig, ProxySnapshot,
};

#[cfg(test)]
pub use probe::MockProxyProber;
