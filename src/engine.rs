use crate::bus::{ExternalSource, MetricStore, OUTPUT_PATHS};
use crate::error::{AppError, Result};
use crate::power::{ConsumptionResult, Phase, PowerReading, Source};
use serde_json::Value;
use tracing::debug;

/// The four readings the engine needs on every tick.
pub struct PowerInputs<S> {
    pub grid_total: S,
    pub grid_l1: S,
    pub pv_total: S,
    pub pv_l1: S,
}

/// Result of a single tick.
#[derive(Debug)]
pub enum TickOutcome {
    Published(ConsumptionResult),
    Faulted(AppError),
}

impl TickOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, TickOutcome::Published(_))
    }
}

pub struct ConsumptionEngine<S, M> {
    inputs: PowerInputs<S>,
    store: M,
}

impl<S, M> ConsumptionEngine<S, M>
where
    S: ExternalSource,
    M: MetricStore,
{
    /// Registers the service identity and the four outputs on `store`.
    pub fn new(inputs: PowerInputs<S>, store: M, identity: &[(String, Value)]) -> Result<Self> {
        store.register(identity, &OUTPUT_PATHS)?;
        Ok(Self { inputs, store })
    }

    /// Read, compute and publish once. Never fails; a fault is reported in the
    /// outcome and nothing is published for this tick.
    pub fn update(&self) -> TickOutcome {
        match self.try_update() {
            Ok(result) => TickOutcome::Published(result),
            Err(e) => TickOutcome::Faulted(e),
        }
    }

    fn try_update(&self) -> Result<ConsumptionResult> {
        let inputs = &self.inputs;
        let grid_total = PowerReading::fetch(Source::Grid, Phase::Total, &inputs.grid_total)?;
        let grid_l1 = PowerReading::fetch(Source::Grid, Phase::L1, &inputs.grid_l1)?;
        let pv_total = PowerReading::fetch(Source::Pv, Phase::Total, &inputs.pv_total)?;
        let pv_l1 = PowerReading::fetch(Source::Pv, Phase::L1, &inputs.pv_l1)?;

        let result = ConsumptionResult::from_readings(&grid_total, &grid_l1, &pv_total, &pv_l1);
        self.store.publish(&result.fields())?;

        debug!(
            grid = ?grid_total.watts,
            pv = ?pv_total.watts,
            consumption = result.total,
            "consumption updated"
        );
        Ok(result)
    }
}
