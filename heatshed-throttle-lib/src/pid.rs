//! Per-sensor PID power-budget calculation.
//!
//! Each tick, the sensor's temperature error against the setpoint of the
//! active target state is turned into a total power budget (mW) that the
//! allocator then splits across the bound cooling devices. Gains are
//! severity-indexed and asymmetric: separate proportional/integral gains
//! apply above and below the setpoint.

use std::time::Duration;

use log::debug;

use crate::config::{CdevInfoMap, PowerStatusMap, SensorInfo, ThrottlingInfo};
use crate::profile::active_bindings;
use crate::registry::CdevVoteRegistry;
use crate::severity::ThrottlingSeverity;
use crate::status::ThrottlingStatus;

/// Severity whose gain tables drive the PID at `curr_severity`.
///
/// The highest severity at or below the current one with a configured
/// `s_power` wins; when nothing at or below is configured, the lowest
/// configured severity above it is used instead. All-NaN tables resolve to
/// `None` (no control).
pub(crate) fn pid_target_state(
    info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
) -> ThrottlingSeverity {
    let mut target = None;
    for severity in ThrottlingSeverity::iter() {
        if info.s_power[severity].is_nan() {
            continue;
        }
        if severity <= curr_severity {
            target = Some(severity);
        } else {
            if target.is_none() {
                target = Some(severity);
            }
            break;
        }
    }
    target.unwrap_or(ThrottlingSeverity::None)
}

/// Integral seed for the first tick: either the configured absolute value or
/// a percentage of the power attainable at the devices' current max votes.
fn initial_i_budget(
    info: &ThrottlingInfo,
    profile: &str,
    cdev_info_map: &CdevInfoMap,
    registry: &CdevVoteRegistry,
) -> f32 {
    if info.i_default_pct.is_nan() {
        return info.i_default;
    }
    let mut attainable = 0.0;
    for name in active_bindings(info, profile).keys() {
        let Some(cdev) = cdev_info_map.get(name) else {
            continue;
        };
        let vote = registry.max_request(name).unwrap_or(0);
        attainable += cdev.state_power(vote);
    }
    attainable * info.i_default_pct / 100.0
}

/// Compute this tick's total power budget and update the sensor's PID
/// memory. Returns `+inf` (no constraint) when the sensor is not throttling.
#[allow(clippy::too_many_arguments)]
pub(crate) fn update_power_budget(
    status: &mut ThrottlingStatus,
    sensor_name: &str,
    temp: f32,
    sensor_info: &SensorInfo,
    cdev_info_map: &CdevInfoMap,
    time_elapsed: Duration,
    curr_severity: ThrottlingSeverity,
    max_throttling: bool,
    sensor_predictions: &[f32],
    registry: &CdevVoteRegistry,
) -> f32 {
    if curr_severity == ThrottlingSeverity::None {
        return f32::INFINITY;
    }
    let Some(info) = sensor_info.throttling_info.as_ref() else {
        return f32::INFINITY;
    };

    let target_state = pid_target_state(info, curr_severity);

    // Saturation over the active binding set: accumulation is blocked in a
    // direction where every device is already pinned.
    let mut is_fully_release = true;
    let mut is_fully_throttle = true;
    for (name, binding) in active_bindings(info, &status.profile) {
        let Some(cdev) = cdev_info_map.get(name) else {
            continue;
        };
        let Some(&request) = status.pid_cdev_request_map.get(name) else {
            continue;
        };
        if request > binding.limit_info[curr_severity] {
            is_fully_release = false;
        }
        if request < binding.ceiling(cdev, curr_severity) {
            is_fully_throttle = false;
        }
    }

    let mut target_changed = false;
    if status.prev_target != ThrottlingSeverity::None
        && target_state != status.prev_target
        && info.tran_cycle > 0
    {
        target_changed = true;
        status.tran_cycle = info.tran_cycle;
    }
    status.prev_target = target_state;

    let target_temp = sensor_info.hot_thresholds[target_state];
    let err = target_temp - temp;

    if max_throttling && err <= 0.0 {
        return info.min_alloc_power[target_state];
    }

    let p = err * if err < 0.0 {
        info.k_po[target_state]
    } else {
        info.k_pu[target_state]
    };

    let mut i = status.i_budget.unwrap_or_else(|| {
        initial_i_budget(info, &status.profile, cdev_info_map, registry)
    });

    let min_alloc = info.min_alloc_power[target_state];
    let max_alloc = info.max_alloc_power[target_state];

    // NaN cutoff compares false: accumulation stays off for severities
    // without a cutoff entry
    if err < info.i_cutoff[target_state] {
        let above_floor = status.prev_power_budget.is_some_and(|b| b > min_alloc);
        let below_ceiling = status.prev_power_budget.is_some_and(|b| b < max_alloc);
        if err < 0.0 && above_floor && !is_fully_throttle {
            i += err * info.k_io[target_state];
        } else if err > 0.0 && below_ceiling && !is_fully_release {
            i += err * info.k_iu[target_state];
        }
    }
    let i_max = info.i_max[target_state];
    if !i_max.is_nan() && i.abs() > i_max {
        i = if i > 0.0 { i_max } else { -i_max };
    }
    status.i_budget = Some(i);

    let dt_ms = time_elapsed.as_millis() as f32;
    let d = match status.prev_err {
        Some(prev_err) if dt_ms > 0.0 => info.k_d[target_state] * (err - prev_err) / dt_ms,
        _ => 0.0,
    };

    let mut compensation = 0.0;
    if let Some(predictor) = &sensor_info.predictor_info {
        if predictor.support_pid_compensation {
            let k = predictor.k_p_compensate[target_state];
            for (weight, prediction) in predictor
                .prediction_weights
                .iter()
                .zip(sensor_predictions)
            {
                compensation += k * weight * (target_temp - prediction * sensor_info.multiplier);
            }
        }
    }

    let mut power_budget = info.s_power[target_state] + p + i + d + compensation;
    if !min_alloc.is_nan() && power_budget < min_alloc {
        power_budget = min_alloc;
    }
    if !max_alloc.is_nan() && power_budget > max_alloc {
        power_budget = max_alloc;
    }

    // Smooth setpoint transients: carry the budget jump caused by a target
    // change and blend it out over the configured number of ticks.
    if target_changed {
        status.budget_transient = status.prev_power_budget.unwrap_or(power_budget) - power_budget;
    }
    if status.tran_cycle > 0 && info.tran_cycle > 0 {
        power_budget +=
            status.budget_transient * (status.tran_cycle as f32 / info.tran_cycle as f32);
        status.tran_cycle -= 1;
    }

    debug!(
        "{sensor_name}: target={target_state} err={err} p={p} i={i} d={d} comp={compensation} \
         budget={power_budget}"
    );

    status.prev_err = Some(err);
    status.prev_power_budget = Some(power_budget);
    power_budget
}

/// Deduct weighted measured power of excluded rails from the sensor's
/// budget, clamping at zero. Rails still warming up (NaN) are skipped.
pub(crate) fn excluded_power_adjustment(
    info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
    power_status_map: &PowerStatusMap,
    budget: f32,
) -> f32 {
    let mut budget = budget;
    for (rail, weights) in &info.excluded_power_info_map {
        let Some(power_status) = power_status_map.get(rail) else {
            continue;
        };
        let avg_power = power_status.last_updated_avg_power;
        let weight = weights[curr_severity];
        if avg_power.is_nan() || weight.is_nan() {
            continue;
        }
        budget -= avg_power * weight;
    }
    budget.max(0.0)
}
