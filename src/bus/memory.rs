//! In-process bus. Backs the test suite and lets the engine run without a
//! broker.

use super::{ExternalSource, MetricStore, ServiceDirectory};
use crate::error::{AppError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    present: HashSet<String>,
    /// Lookups left before a service shows up
    pending: HashMap<String, u32>,
    lookups: HashMap<String, u32>,
    values: HashMap<(String, String), f64>,
    read_faults: HashSet<(String, String)>,
    identity: HashMap<String, BTreeMap<String, Value>>,
    outputs: HashMap<String, BTreeMap<String, f64>>,
    publishes: HashMap<String, u64>,
    fail_publish: bool,
    fail_register: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `service` visible to discovery right away.
    pub fn announce(&self, service: &str) {
        self.state().present.insert(service.to_string());
    }

    /// Make `service` visible once it has been looked up `lookups` times.
    pub fn announce_after(&self, service: &str, lookups: u32) {
        if lookups == 0 {
            self.announce(service);
        } else {
            self.state().pending.insert(service.to_string(), lookups);
        }
    }

    pub fn lookup_count(&self, service: &str) -> u32 {
        self.state().lookups.get(service).copied().unwrap_or(0)
    }

    /// Set or clear (`None`) a value. Setting a value also announces the service.
    pub fn set_value(&self, service: &str, path: &str, value: Option<f64>) {
        let mut state = self.state();
        let key = (service.to_string(), path.to_string());
        match value {
            Some(v) => {
                state.values.insert(key, v);
                state.present.insert(service.to_string());
            }
            None => {
                state.values.remove(&key);
            }
        }
    }

    pub fn set_read_fault(&self, service: &str, path: &str, failing: bool) {
        let key = (service.to_string(), path.to_string());
        let mut state = self.state();
        if failing {
            state.read_faults.insert(key);
        } else {
            state.read_faults.remove(&key);
        }
    }

    pub fn set_publish_fault(&self, failing: bool) {
        self.state().fail_publish = failing;
    }

    pub fn set_register_fault(&self, failing: bool) {
        self.state().fail_register = failing;
    }

    pub fn source(&self, service: &str, path: &str) -> MemorySource {
        MemorySource {
            bus: self.clone(),
            service: service.to_string(),
            path: path.to_string(),
        }
    }

    pub fn store(&self, service: &str) -> MemoryStore {
        MemoryStore {
            bus: self.clone(),
            service: service.to_string(),
        }
    }

    /// Current outputs of a published service, as one consistent snapshot.
    pub fn outputs(&self, service: &str) -> Option<BTreeMap<String, f64>> {
        self.state().outputs.get(service).cloned()
    }

    pub fn output(&self, service: &str, path: &str) -> Option<f64> {
        self.state()
            .outputs
            .get(service)
            .and_then(|o| o.get(path).copied())
    }

    pub fn identity(&self, service: &str, path: &str) -> Option<Value> {
        self.state()
            .identity
            .get(service)
            .and_then(|i| i.get(path).cloned())
    }

    pub fn publish_count(&self, service: &str) -> u64 {
        self.state().publishes.get(service).copied().unwrap_or(0)
    }
}

impl ServiceDirectory for MemoryBus {
    fn exists(&self, service: &str) -> Result<bool> {
        let mut state = self.state();
        *state.lookups.entry(service.to_string()).or_default() += 1;
        if let Some(left) = state.pending.get_mut(service) {
            *left -= 1;
            if *left == 0 {
                state.pending.remove(service);
                state.present.insert(service.to_string());
            }
        }
        Ok(state.present.contains(service))
    }
}

pub struct MemorySource {
    bus: MemoryBus,
    service: String,
    path: String,
}

impl ExternalSource for MemorySource {
    fn service(&self) -> &str {
        &self.service
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn get_value(&self) -> Result<Option<f64>> {
        let state = self.bus.state();
        let key = (self.service.clone(), self.path.clone());
        if state.read_faults.contains(&key) {
            return Err(AppError::Read {
                service: self.service.clone(),
                path: self.path.clone(),
                reason: "injected fault".into(),
            });
        }
        Ok(state.values.get(&key).copied())
    }
}

pub struct MemoryStore {
    bus: MemoryBus,
    service: String,
}

impl MetricStore for MemoryStore {
    fn register(&self, identity: &[(String, Value)], outputs: &[&str]) -> Result<()> {
        let mut state = self.bus.state();
        if state.fail_register {
            return Err(AppError::Registration(format!(
                "{} rejected by bus",
                self.service
            )));
        }
        state.identity.insert(
            self.service.clone(),
            identity.iter().cloned().collect(),
        );
        state.outputs.insert(
            self.service.clone(),
            outputs.iter().map(|p| (p.to_string(), 0.0)).collect(),
        );
        Ok(())
    }

    fn publish(&self, values: &[(&str, f64)]) -> Result<()> {
        let mut state = self.bus.state();
        if state.fail_publish {
            return Err(AppError::Publish("injected fault".into()));
        }
        let outputs = state
            .outputs
            .get_mut(&self.service)
            .ok_or_else(|| AppError::Publish(format!("{} is not registered", self.service)))?;
        // Validate the whole batch before touching anything.
        if let Some((path, _)) = values.iter().find(|(p, _)| !outputs.contains_key(*p)) {
            return Err(AppError::Publish(format!("unknown output path {path}")));
        }
        for (path, w) in values {
            outputs.insert(path.to_string(), *w);
        }
        *state.publishes.entry(self.service.clone()).or_default() += 1;
        Ok(())
    }
}
