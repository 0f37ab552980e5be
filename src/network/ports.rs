// src/network/ports.rs

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::debug;

use crate::bundle::SettingsMap;

/// Ports handed to one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    /// Application server port
    pub app: u16,

    /// In-deployment reverse proxy port
    pub proxy: u16,

    /// Cache service port
    pub cache: u16,
}

impl PortSet {
    /// The settings entries carrying the ports
    pub fn to_settings(&self) -> SettingsMap {
        vec![
            ("APP_PORT", self.app.to_string()),
            ("NGINX_PORT", self.proxy.to_string()),
            ("REDIS_PORT", self.cache.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

/// Reserves free local ports.
///
/// The operating system is asked at every allocation; nothing is cached
/// between deployments. All three sockets are held at once, so the ports are
/// distinct, and released before returning so the containers can bind them.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    /// Address the reservation sockets bind to
    bind_addr: IpAddr,
}

impl PortAllocator {
    /// Allocator probing all interfaces
    pub fn new() -> Self {
        Self::with_bind_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Allocator probing one address
    pub fn with_bind_addr(bind_addr: IpAddr) -> Self {
        Self { bind_addr }
    }

    /// Allocates three distinct free ports
    pub async fn allocate(&self) -> Result<PortSet, PortError> {
        let app = self.reserve().await?;
        let proxy = self.reserve().await?;
        let cache = self.reserve().await?;

        let ports = PortSet {
            app: port_of(&app)?,
            proxy: port_of(&proxy)?,
            cache: port_of(&cache)?,
        };
        debug!("Allocated ports {:?}", ports);

        Ok(ports)
    }

    async fn reserve(&self) -> Result<TcpListener, PortError> {
        TcpListener::bind(SocketAddr::new(self.bind_addr, 0))
            .await
            .map_err(|e| PortError::Unavailable(e.to_string()))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn port_of(listener: &TcpListener) -> Result<u16, PortError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| PortError::Unavailable(e.to_string()))
}

/// Port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    /// No free port could be reserved
    #[error("No free port available: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ports_are_distinct_and_nonzero() {
        let ports = PortAllocator::with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .allocate()
            .await
            .unwrap();

        assert_ne!(ports.app, 0);
        assert_ne!(ports.app, ports.proxy);
        assert_ne!(ports.proxy, ports.cache);
        assert_ne!(ports.app, ports.cache);
    }

    #[tokio::test]
    async fn allocated_ports_are_released() {
        let ports = PortAllocator::with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .allocate()
            .await
            .unwrap();

        TcpListener::bind(("127.0.0.1", ports.app)).await.unwrap();
    }

    #[test]
    fn settings_use_the_deployment_key_names() {
        let ports = PortSet {
            app: 8001,
            proxy: 8002,
            cache: 8003,
        };

        assert_eq!(
            ports.to_settings().to_env_format(),
            "APP_PORT=8001\nNGINX_PORT=8002\nREDIS_PORT=8003"
        );
    }
}
