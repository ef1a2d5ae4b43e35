//! Power readings and the consumption formula.
//!
//! Sign convention of the grid meter: negative means import from the grid,
//! positive means export to the grid.

use crate::bus::{ExternalSource, AC_L1_POWER, AC_L2_POWER, AC_L3_POWER, AC_POWER};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Grid,
    Pv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Total,
    L1,
}

impl Phase {
    pub fn path(self) -> &'static str {
        match self {
            Phase::Total => AC_POWER,
            Phase::L1 => AC_L1_POWER,
        }
    }
}

/// A single reading as fetched on one tick. `watts` is `None` when the source
/// has no value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub source: Source,
    pub phase: Phase,
    pub watts: Option<f64>,
}

impl PowerReading {
    pub fn fetch<S: ExternalSource + ?Sized>(
        source: Source,
        phase: Phase,
        input: &S,
    ) -> Result<Self> {
        let watts = input.get_value()?;
        if let Some(value) = watts {
            if !value.is_finite() {
                return Err(AppError::InvalidReading {
                    service: input.service().to_string(),
                    path: input.path().to_string(),
                    value,
                });
            }
        }
        Ok(Self {
            source,
            phase,
            watts,
        })
    }

    /// Unavailable collapses to 0 W.
    pub fn value_or_zero(&self) -> f64 {
        self.watts.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConsumptionResult {
    pub total: f64,
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
}

impl ConsumptionResult {
    /// Recover household consumption from the net grid flow and PV production.
    ///
    /// The grid meter sits between the grid and the PV inverter, so it only
    /// sees what is left after PV has fed the loads. Which way the two are
    /// recombined depends on the direction of the net flow, decided by
    /// `grid_total` alone. L1 follows the total's branch.
    pub fn compute(grid_total: f64, grid_l1: f64, pv_total: f64, pv_l1: f64) -> Self {
        let (total, l1) = if grid_total < 0.0 {
            (grid_total.abs() + pv_total, grid_l1.abs() + pv_l1)
        } else {
            (pv_total - grid_total, pv_l1 - grid_l1)
        };
        Self {
            total: non_negative(total),
            l1: non_negative(l1),
            l2: 0.0,
            l3: 0.0,
        }
    }

    pub fn from_readings(
        grid_total: &PowerReading,
        grid_l1: &PowerReading,
        pv_total: &PowerReading,
        pv_l1: &PowerReading,
    ) -> Self {
        Self::compute(
            grid_total.value_or_zero(),
            grid_l1.value_or_zero(),
            pv_total.value_or_zero(),
            pv_l1.value_or_zero(),
        )
    }

    /// Output paths with their values, in publishing order.
    pub fn fields(&self) -> [(&'static str, f64); 4] {
        [
            (AC_POWER, self.total),
            (AC_L1_POWER, self.l1),
            (AC_L2_POWER, self.l2),
            (AC_L3_POWER, self.l3),
        ]
    }
}

// Also folds -0.0 into 0.0.
fn non_negative(w: f64) -> f64 {
    if w > 0.0 {
        w
    } else {
        0.0
    }
}

/// Display text for a wattage, e.g. `702.0 W`.
pub fn format_watts(w: f64) -> String {
    format!("{w:.1} W")
}
