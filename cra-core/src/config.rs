//! Runtime configuration for workers, clients and the metadata store.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding [`MetadataConfig::root`].
pub const METADATA_ROOT_ENV: &str = "CRA_METADATA_ROOT";

/// Default capacity of a per-peer connection pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub instance_name: String,
    /// Address published in the instance row. Auto-detected when `None`.
    pub ip_address: Option<IpAddr>,
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    pub heartbeat: HeartbeatConfig,
    pub connection_pool_capacity: usize,
    /// When false the worker only hosts the vertex types it was started with
    /// and never reloads vertices from metadata.
    pub allow_dynamic_loading: bool,
    pub recover_on_start: bool,
}

impl WorkerConfig {
    pub fn new(instance_name: impl Into<String>, port: u16) -> Self {
        Self {
            instance_name: instance_name.into(),
            ip_address: None,
            port,
            heartbeat: HeartbeatConfig::default(),
            connection_pool_capacity: DEFAULT_POOL_CAPACITY,
            allow_dynamic_loading: true,
            recover_on_start: true,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat.interval = interval;
        self
    }

    pub fn without_recovery(mut self) -> Self {
        self.recover_on_start = false;
        self
    }

    /// Configuration of a client-hosted worker: ephemeral port, loopback,
    /// no dynamic loading, no recovery.
    pub fn sideloaded(instance_name: impl Into<String>) -> Self {
        Self {
            ip_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            allow_dynamic_loading: false,
            recover_on_start: false,
            ..Self::new(instance_name, 0)
        }
    }

    pub fn resolved_ip(&self) -> IpAddr {
        self.ip_address.unwrap_or_else(detect_local_ipv4)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Instance hosted by the client process, if any. Used to pick the
    /// connection initiator nearest to the client.
    pub local_instance: Option<String>,
    pub recovering_retries: usize,
    pub retry_delay: Duration,
    pub connection_pool_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_instance: None,
            recovering_retries: 20,
            retry_delay: Duration::from_millis(250),
            connection_pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub root: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("CRA").join("metadata"),
        }
    }
}

impl MetadataConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        match std::env::var_os(METADATA_ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::new(root),
            _ => Self::default(),
        }
    }
}

/// First non-loopback IPv4 address of this host, or loopback if none is
/// routable. The probe socket never sends a packet.
pub fn detect_local_ipv4() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => IpAddr::V4(ip),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
