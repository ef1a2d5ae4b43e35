use crate::discovery::RetryPolicy;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
    pub sources: SourcesConfig,
    pub discovery: DiscoveryConfig,
    pub update_interval_ms: u64,
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            bus: BusConfig::default(),
            sources: SourcesConfig::default(),
            discovery: DiscoveryConfig::default(),
            update_interval_ms: 2000,
            service: ServiceConfig::default(),
        }
    }
}

/// System-wide broker. A session broker from `SESSION_BUS_ADDRESS` takes
/// precedence, see [`crate::bus::BusAddress::select`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for the generated client id
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "consumption-calc".into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Topic prefix shared by every service on the bus
    pub root: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            root: "venus".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub grid: String,
    pub pv: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            grid: "com.victronenergy.grid.huawei_meter".into(),
            pv: "com.victronenergy.pvinverter.sun2000".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 30,
            retry_interval_ms: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

/// Identity of the published service. Written once at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub device_instance: u32,
    pub product_id: u32,
    pub product_name: String,
    pub custom_name: String,
    pub firmware_version: f64,
    pub hardware_version: u32,
    pub role: String,
    pub serial: String,
    pub connection: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "com.victronenergy.acload.consumption_calc".into(),
            device_instance: 100,
            product_id: 0,
            product_name: "Consumption Calculator".into(),
            custom_name: "AC Loads".into(),
            firmware_version: 1.0,
            hardware_version: 0,
            role: "acload".into(),
            serial: "CALC001".into(),
            connection: "Calculated from Grid + PV".into(),
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards MQTT_HOST / MQTT_PORT override the system broker.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut cfg = Self::parse(&raw)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            cfg.mqtt.port = port
                .parse()
                .map_err(|_| AppError::Config(format!("invalid MQTT_PORT: {port}")))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a YAML document without touching the environment overrides.
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.grid.is_empty() || self.sources.pv.is_empty() {
            return Err(AppError::Config(
                "sources.grid and sources.pv cannot be empty".into(),
            ));
        }
        if self.sources.grid == self.sources.pv {
            return Err(AppError::Config(format!(
                "grid and pv sources must differ (both are {})",
                self.sources.grid
            )));
        }
        if self.service.name.is_empty() {
            return Err(AppError::Config("service.name cannot be empty".into()));
        }
        if self.discovery.max_retries == 0 {
            return Err(AppError::Config(
                "discovery.max_retries must be at least 1".into(),
            ));
        }
        if self.discovery.retry_interval_ms == 0 || self.update_interval_ms == 0 {
            return Err(AppError::Config("intervals cannot be 0".into()));
        }
        if self.mqtt.port == 0 {
            return Err(AppError::Config("mqtt.port cannot be 0".into()));
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$"; any other '$' is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
