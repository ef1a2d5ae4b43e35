use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("{service} not found after {attempts} retries")]
    DependencyUnavailable { service: String, attempts: u32 },
    #[error("read of {service}/{path} failed: {reason}")]
    Read {
        service: String,
        path: String,
        reason: String,
    },
    #[error("{service}/{path} reported a non-finite value ({value})")]
    InvalidReading {
        service: String,
        path: String,
        value: f64,
    },
    #[error("Publish error: {0}")]
    Publish(String),
    #[error("Registration error: {0}")]
    Registration(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
