//! Hard-limit and release-logic request paths.
//!
//! Both run after allocation in the same tick. Hard limits are pure table
//! lookups; release steps compare measured rail power against per-severity
//! thresholds and relax (or tighten) the combined request accordingly.

use log::debug;

use crate::config::{CdevInfoMap, PowerStatusMap, ReleaseLogic, ThrottlingInfo};
use crate::profile::binding_for;
use crate::severity::ThrottlingSeverity;
use crate::status::ThrottlingStatus;

/// Refresh every hard-limit request from the severity table of its binding.
pub(crate) fn update_hard_limit_requests(
    status: &mut ThrottlingStatus,
    info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
) {
    let ThrottlingStatus {
        profile,
        hardlimit_cdev_request_map,
        ..
    } = status;
    for (name, request) in hardlimit_cdev_request_map.iter_mut() {
        let Some(binding) = binding_for(info, profile, name) else {
            continue;
        };
        *request = if binding.enabled {
            binding.limit_info[curr_severity]
        } else {
            0
        };
    }
}

/// Advance every release step from its rail power and release policy.
pub(crate) fn update_release_steps(
    status: &mut ThrottlingStatus,
    sensor_name: &str,
    info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
    power_status_map: &PowerStatusMap,
    cdev_info_map: &CdevInfoMap,
) {
    let ThrottlingStatus {
        profile,
        throttling_release_map,
        ..
    } = status;
    for (name, release_step) in throttling_release_map.iter_mut() {
        let Some(binding) = binding_for(info, profile, name) else {
            continue;
        };
        let Some(cdev) = cdev_info_map.get(name.as_str()) else {
            continue;
        };
        let max_state = cdev.max_state;

        let avg_power = binding
            .power_rail
            .as_deref()
            .and_then(|rail| power_status_map.get(rail))
            .map_or(f32::NAN, |s| s.last_updated_avg_power);
        if avg_power.is_nan() || avg_power < 0.0 {
            // No usable measurement: power-linked devices fail open to a
            // full release, everything else holds at zero
            *release_step = if binding.throttling_with_power_link {
                max_state
            } else {
                0
            };
            continue;
        }

        let threshold = binding.power_thresholds[curr_severity];
        if threshold.is_nan() {
            *release_step = 0;
            continue;
        }

        let is_over_budget = if binding.high_power_check {
            avg_power <= threshold
        } else {
            avg_power >= threshold
        };

        *release_step = match binding.release_logic {
            ReleaseLogic::Increase => {
                if is_over_budget {
                    0
                } else {
                    (*release_step - 1).max(-max_state)
                }
            }
            ReleaseLogic::Decrease => {
                if is_over_budget {
                    0
                } else {
                    (*release_step + 1).min(max_state)
                }
            }
            ReleaseLogic::Stepwise => {
                if is_over_budget {
                    (*release_step - 1).max(-max_state)
                } else {
                    (*release_step + 1).min(max_state)
                }
            }
            ReleaseLogic::ReleaseToFloor => {
                if is_over_budget {
                    0
                } else {
                    max_state
                }
            }
            ReleaseLogic::None => *release_step,
        };
        debug!(
            "{sensor_name}: {name} avg_power={avg_power} threshold={threshold} \
             release_step={release_step}"
        );
    }
}
