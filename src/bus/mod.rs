pub mod memory;
pub mod mqtt;

use crate::config::{MqttConfig, ServiceConfig};
use crate::error::{AppError, Result};
use serde_json::{json, Value};

pub const AC_POWER: &str = "Ac/Power";
pub const AC_L1_POWER: &str = "Ac/L1/Power";
pub const AC_L2_POWER: &str = "Ac/L2/Power";
pub const AC_L3_POWER: &str = "Ac/L3/Power";

/// Paths the consumption service publishes on every tick.
pub const OUTPUT_PATHS: [&str; 4] = [AC_POWER, AC_L1_POWER, AC_L2_POWER, AC_L3_POWER];

/// A remote value published by another service, addressed by service + path.
pub trait ExternalSource {
    fn service(&self) -> &str;
    fn path(&self) -> &str;
    /// Latest known value; `Ok(None)` when the service has not published one.
    fn get_value(&self) -> Result<Option<f64>>;
}

/// The local endpoint this process publishes on.
pub trait MetricStore {
    /// Publish static identity fields and declare the numeric outputs.
    fn register(&self, identity: &[(String, Value)], outputs: &[&str]) -> Result<()>;
    /// Write all `values` as one indivisible update.
    fn publish(&self, values: &[(&str, f64)]) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ServiceDirectory {
    fn exists(&self, service: &str) -> Result<bool>;
}

/// Identity and management fields of the published service.
pub fn registration_fields(service: &ServiceConfig) -> Vec<(String, Value)> {
    vec![
        ("Mgmt/ProcessName".into(), json!(env!("CARGO_PKG_NAME"))),
        (
            "Mgmt/ProcessVersion".into(),
            json!(format!("v{} on Rust", env!("CARGO_PKG_VERSION"))),
        ),
        ("Mgmt/Connection".into(), json!(service.connection)),
        ("DeviceInstance".into(), json!(service.device_instance)),
        ("ProductId".into(), json!(service.product_id)),
        ("ProductName".into(), json!(service.product_name)),
        ("CustomName".into(), json!(service.custom_name)),
        ("FirmwareVersion".into(), json!(service.firmware_version)),
        ("HardwareVersion".into(), json!(service.hardware_version)),
        ("Connected".into(), json!(1)),
        ("Role".into(), json!(service.role)),
        ("Serial".into(), json!(service.serial)),
    ]
}

/// Environment indicator that selects a session-scoped broker.
pub const SESSION_BUS_ENV: &str = "SESSION_BUS_ADDRESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusScope {
    Session,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub scope: BusScope,
    pub host: String,
    pub port: u16,
}

impl BusAddress {
    pub fn select(cfg: &MqttConfig) -> Result<Self> {
        Self::from_session(std::env::var(SESSION_BUS_ENV).ok().as_deref(), cfg)
    }

    /// `session` is `host[:port]`; without it the configured system broker is used.
    pub fn from_session(session: Option<&str>, cfg: &MqttConfig) -> Result<Self> {
        let Some(addr) = session.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self {
                scope: BusScope::System,
                host: cfg.host.clone(),
                port: cfg.port,
            });
        };
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    AppError::Config(format!("invalid port in {SESSION_BUS_ENV}: {addr}"))
                })?;
                (host, port)
            }
            None => (addr, 1883),
        };
        if host.is_empty() {
            return Err(AppError::Config(format!(
                "missing host in {SESSION_BUS_ENV}: {addr}"
            )));
        }
        Ok(Self {
            scope: BusScope::Session,
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_bus_without_indicator() {
        let cfg = MqttConfig::default();
        let addr = BusAddress::from_session(None, &cfg).unwrap();
        assert_eq!(addr.scope, BusScope::System);
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 1883);
    }

    #[test]
    fn test_session_bus_from_indicator() {
        let cfg = MqttConfig::default();
        let addr = BusAddress::from_session(Some("10.0.0.5:1884"), &cfg).unwrap();
        assert_eq!(
            addr,
            BusAddress {
                scope: BusScope::Session,
                host: "10.0.0.5".into(),
                port: 1884,
            }
        );

        let addr = BusAddress::from_session(Some("broker.local"), &cfg).unwrap();
        assert_eq!(addr.port, 1883);
    }

    #[test]
    fn test_blank_indicator_falls_back_to_system() {
        let cfg = MqttConfig::default();
        let addr = BusAddress::from_session(Some("  "), &cfg).unwrap();
        assert_eq!(addr.scope, BusScope::System);
    }

    #[test]
    fn test_bad_session_port() {
        let cfg = MqttConfig::default();
        assert!(BusAddress::from_session(Some("host:abc"), &cfg).is_err());
        assert!(BusAddress::from_session(Some(":1883"), &cfg).is_err());
    }

    #[test]
    fn test_registration_fields() {
        let fields = registration_fields(&ServiceConfig::default());
        let get = |path: &str| {
            fields
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("DeviceInstance"), Some(json!(100)));
        assert_eq!(get("Role"), Some(json!("acload")));
        assert_eq!(get("Serial"), Some(json!("CALC001")));
        assert_eq!(get("Connected"), Some(json!(1)));
        assert_eq!(get("Mgmt/ProcessName"), Some(json!("consumption-calc")));
        assert!(get("Ac/Power").is_none());
    }
}
