//! Per-sensor mutable throttling state.

use indexmap::IndexMap;
use serde::Serialize;

use crate::config::{CdevInfoMap, ThrottlingInfo};
use crate::severity::{ThrottlingSeverity, SEVERITY_COUNT};

/// Everything the control loop remembers about one sensor between ticks.
///
/// PID memory uses `Option<f32>` for "no value yet"; the NaN sentinel stays
/// confined to the read-only config tables.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ThrottlingStatus {
    pub prev_err: Option<f32>,
    pub i_budget: Option<f32>,
    pub prev_power_budget: Option<f32>,
    pub prev_target: ThrottlingSeverity,
    /// Remaining setpoint-transient smoothing ticks.
    pub tran_cycle: u32,
    /// Budget delta captured at the last target change, blended out over
    /// `tran_cycle` ticks.
    pub budget_transient: f32,
    /// Active binding profile; empty selects the default binding.
    pub profile: String,
    /// Latest PID power budget (mW) per cooling device.
    pub pid_power_budget_map: IndexMap<String, f32>,
    /// Latest PID state request per cooling device.
    pub pid_cdev_request_map: IndexMap<String, i32>,
    /// Latest table-driven hard-limit request per cooling device.
    pub hardlimit_cdev_request_map: IndexMap<String, i32>,
    /// Latest release step per cooling device (negative adds throttle).
    pub throttling_release_map: IndexMap<String, i32>,
    /// Last combined request this sensor voted for, per cooling device.
    pub cdev_status_map: IndexMap<String, i32>,
}

impl ThrottlingStatus {
    /// Build the per-device maps for a sensor from its default binding.
    ///
    /// Map membership is decided per concern: a device enters the PID maps
    /// when it carries a usable weight at any severity, the hard-limit map
    /// when any `limit_info` entry is nonzero, and the release map when it
    /// names a rail with at least one threshold. `cdev_status_map` is the
    /// union; devices outside it never receive a vote from this sensor.
    #[must_use]
    pub fn from_throttling_info(info: &ThrottlingInfo, cdev_info_map: &CdevInfoMap) -> Self {
        let mut status = Self::default();

        for (name, binding) in &info.binded_cdev_info_map {
            let has_pid_weight = (0..SEVERITY_COUNT).any(|i| {
                let weight = binding.cdev_weight_for_pid.0[i];
                !weight.is_nan() && weight != 0.0
            });
            let has_hard_limit = binding.limit_info.0.iter().any(|&limit| limit != 0);
            let has_power_threshold = binding.power_rail.is_some()
                && binding.power_thresholds.0.iter().any(|t| !t.is_nan());

            if has_pid_weight {
                // Start unthrottled: full power budget, state 0
                let initial_budget = cdev_info_map
                    .get(name)
                    .map_or(0.0, |cdev| cdev.state_power(0));
                status
                    .pid_power_budget_map
                    .insert(name.clone(), initial_budget);
                status.pid_cdev_request_map.insert(name.clone(), 0);
            }
            if has_hard_limit {
                status.hardlimit_cdev_request_map.insert(name.clone(), 0);
            }
            if has_power_threshold {
                status.throttling_release_map.insert(name.clone(), 0);
            }
            if has_pid_weight || has_hard_limit || has_power_threshold {
                status.cdev_status_map.insert(name.clone(), 0);
            }
        }

        status
    }

    /// Reset PID memory and zero every per-device field. Map membership and
    /// the active profile are preserved.
    pub fn clear(&mut self) {
        self.prev_err = None;
        self.i_budget = None;
        self.prev_power_budget = None;
        self.prev_target = ThrottlingSeverity::None;
        self.tran_cycle = 0;
        self.budget_transient = 0.0;
        for budget in self.pid_power_budget_map.values_mut() {
            *budget = 0.0;
        }
        for request in self.pid_cdev_request_map.values_mut() {
            *request = 0;
        }
        for request in self.hardlimit_cdev_request_map.values_mut() {
            *request = 0;
        }
        for step in self.throttling_release_map.values_mut() {
            *step = 0;
        }
        for request in self.cdev_status_map.values_mut() {
            *request = 0;
        }
    }
}
