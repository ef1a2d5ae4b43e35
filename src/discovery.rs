//! Startup gate: wait for the services we read from to show up on the bus.

use crate::bus::ServiceDirectory;
use crate::error::{AppError, Result};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first one.
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 30,
            retry_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Unknown,
    Found,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    state: Availability,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Availability::Unknown,
        }
    }

    pub fn state(&self) -> Availability {
        self.state
    }
}

/// Look up `endpoint` until it exists, sleeping `retry_interval` between attempts.
///
/// A lookup error counts as a failed attempt. There is no sleep after the last
/// attempt. An endpoint that already left `Unknown` is not looked up again.
pub async fn wait_for<P>(
    directory: &P,
    endpoint: &mut ServiceEndpoint,
    policy: RetryPolicy,
) -> Result<()>
where
    P: ServiceDirectory + ?Sized,
{
    match endpoint.state {
        Availability::Found => return Ok(()),
        Availability::TimedOut => return Err(unavailable(endpoint, policy)),
        Availability::Unknown => {}
    }

    info!("Waiting for {}...", endpoint.name);
    for attempt in 1..=policy.max_retries {
        match directory.exists(&endpoint.name) {
            Ok(true) => {
                info!(attempt, "  ✓ {} found", endpoint.name);
                endpoint.state = Availability::Found;
                return Ok(());
            }
            Ok(false) => debug!(attempt, service = %endpoint.name, "not present yet"),
            Err(e) => debug!(attempt, service = %endpoint.name, error = %e, "lookup failed"),
        }
        if attempt < policy.max_retries {
            tokio::time::sleep(policy.retry_interval).await;
        }
    }

    error!(
        "  ✗ {} not found after {} retries",
        endpoint.name, policy.max_retries
    );
    endpoint.state = Availability::TimedOut;
    Err(unavailable(endpoint, policy))
}

/// Wait for each service in turn. Stops at the first one that never appears.
pub async fn wait_for_all<P>(
    directory: &P,
    services: &[&str],
    policy: RetryPolicy,
) -> Result<Vec<ServiceEndpoint>>
where
    P: ServiceDirectory + ?Sized,
{
    let mut found = Vec::with_capacity(services.len());
    for name in services {
        let mut endpoint = ServiceEndpoint::new(*name);
        wait_for(directory, &mut endpoint, policy).await?;
        found.push(endpoint);
    }
    Ok(found)
}

fn unavailable(endpoint: &ServiceEndpoint, policy: RetryPolicy) -> AppError {
    AppError::DependencyUnavailable {
        service: endpoint.name.clone(),
        attempts: policy.max_retries,
    }
}
