// Network subsystem

/// Free-port reservation
pub mod ports;
/// Host reverse-proxy site file
pub mod proxy;

// Re-exports
pub use ports::{PortAllocator, PortError, PortSet};
pub use proxy::{ProxyError, ProxySite};
