use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

const ENV_ENABLED: &str = "DHCPSERVER_ENABLED";
const ENV_SERVER_IP: &str = "DHCPSERVER_IP";
const ENV_RANGE_START: &str = "DHCPSERVER_RANGESTART";
const ENV_GATEWAY: &str = "DHCPSERVER_GATEWAY";
const ENV_DNS: &str = "DHCPSERVER_DNS";

/// Number of addresses handed out when the config does not say otherwise.
pub const DEFAULT_POOL_SIZE: u32 = 50;

/// Two hours.
pub const DEFAULT_LEASE_DURATION_SECONDS: u32 = 7200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub enabled: bool,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_size: u32,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration_seconds: u32,
    pub boot_filename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            server_ip: Ipv4Addr::new(192, 168, 200, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 200, 10),
            pool_size: DEFAULT_POOL_SIZE,
            gateway: Some(Ipv4Addr::new(192, 168, 200, 1)),
            dns_servers: vec![Ipv4Addr::new(192, 168, 200, 1)],
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            boot_filename: "lpxelinux.0".to_string(),
        }
    }
}

impl Config {
    /// Loads the config file (writing the defaults if it is missing), then
    /// applies `DHCPSERVER_*` environment overrides and validates the result.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save(path)?;
            config
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides file values with whatever `lookup` returns for the
    /// `DHCPSERVER_*` keys. Blank values are treated as unset, so an unset
    /// `DHCPSERVER_ENABLED` leaves the file's `enabled` flag in force.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_of = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(enabled) = value_of(ENV_ENABLED) {
            self.enabled = enabled.trim() == "true";
        }
        if let Some(value) = value_of(ENV_SERVER_IP) {
            self.server_ip = parse_address(ENV_SERVER_IP, &value)?;
        }
        if let Some(value) = value_of(ENV_RANGE_START) {
            self.pool_start = parse_address(ENV_RANGE_START, &value)?;
        }
        if let Some(value) = value_of(ENV_GATEWAY) {
            self.gateway = Some(parse_address(ENV_GATEWAY, &value)?);
        }
        if let Some(value) = value_of(ENV_DNS) {
            self.dns_servers = vec![parse_address(ENV_DNS, &value)?];
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if u32::from(self.pool_start)
            .checked_add(self.pool_size - 1)
            .is_none()
        {
            return Err(Error::InvalidConfig(
                "pool extends past 255.255.255.255".to_string(),
            ));
        }

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway
            && self.ip_in_pool(gateway)
        {
            return Err(Error::InvalidConfig(
                "gateway must not be within the pool range".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.boot_filename.len() > 255 {
            return Err(Error::InvalidConfig(
                "boot_filename must fit in a single DHCP option".to_string(),
            ));
        }

        Ok(())
    }

    /// Last address of the pool (inclusive).
    pub fn pool_end(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.pool_start).saturating_add(self.pool_size.saturating_sub(1)))
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip)
            .checked_sub(u32::from(self.pool_start))
            .is_some_and(|offset| offset < self.pool_size)
    }
}

fn parse_address(key: &str, value: &str) -> Result<Ipv4Addr> {
    Ipv4Addr::from_str(value.trim())
        .map_err(|_| Error::InvalidConfig(format!("{} is not an IPv4 address: {:?}", key, value)))
}
