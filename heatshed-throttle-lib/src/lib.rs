//! Closed-loop thermal throttling control core.
//!
//! For each registered sensor, a control tick turns the measured temperature
//! into a power budget (severity-tuned PID), splits the budget across the
//! sensor's bound cooling devices (weighted, rail-compensated, slew-limited),
//! and runs table-driven hard-limit and power-release paths alongside. A
//! cross-sensor vote registry aggregates per-device requests (each device's
//! effective state is the maximum vote) and reports devices whose effective
//! state changed so external actuators can be driven.
//!
//! The crate is deliberately hardware-agnostic: temperature sampling,
//! severity computation, rail power averaging, and sysfs actuation all live
//! upstream or downstream of this core and appear here only as plain data
//! ([`PowerStatusMap`], [`CdevInfoMap`]) or small traits ([`ProfileSource`],
//! [`RequestStatsSink`]).

use std::sync::RwLock;
use std::time::Duration;

use derive_more::{Display, Error};
use indexmap::IndexMap;
use log::{debug, info, warn};

mod allocator;
mod combine;
mod config;
mod pid;
mod profile;
mod registry;
mod release;
mod severity;
mod status;

pub use combine::RequestStatsSink;
pub use config::{
    BindedCdevInfo, BindedCdevInfoMap, CdevInfo, CdevInfoMap, PowerStatus, PowerStatusMap,
    PredictorInfo, ReleaseLogic, SensorInfo, ThrottlingInfo,
};
pub use profile::ProfileSource;
pub use registry::CdevVoteRegistry;
pub use severity::{PerSeverity, ThrottlingSeverity, SEVERITY_COUNT};
pub use status::ThrottlingStatus;

/// Registration failure. Control ticks are never attempted for a sensor
/// whose registration was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum RegisterError {
    #[display("sensor {sensor} is already registered")]
    DuplicateSensor { sensor: String },
    #[display("sensor {sensor} binds unknown cooling device {cdev}")]
    UnknownCdev { sensor: String, cdev: String },
    #[display("sensor {sensor} has no cooling device bindings")]
    NoBindings { sensor: String },
}

/// The control core: per-sensor throttling state plus the cross-sensor vote
/// registry.
///
/// One control thread is expected to drive [`throttling_update`] and
/// [`compute_cooling_devices_request`] per sensor per sampling interval;
/// [`get_cdev_max_request`] may be queried concurrently from other threads.
///
/// [`throttling_update`]: Self::throttling_update
/// [`compute_cooling_devices_request`]: Self::compute_cooling_devices_request
/// [`get_cdev_max_request`]: Self::get_cdev_max_request
pub struct ThrottlingController {
    sensor_status_map: RwLock<IndexMap<String, ThrottlingStatus>>,
    registry: CdevVoteRegistry,
    profile_source: Box<dyn ProfileSource>,
}

impl Default for ThrottlingController {
    fn default() -> Self {
        Self::new(())
    }
}

impl ThrottlingController {
    /// Create a controller; `profile_source` answers per-sensor binding
    /// profile lookups (use `()` when profiles are not in play).
    pub fn new(profile_source: impl ProfileSource + 'static) -> Self {
        Self {
            sensor_status_map: RwLock::new(IndexMap::new()),
            registry: CdevVoteRegistry::new(),
            profile_source: Box::new(profile_source),
        }
    }

    /// Register a sensor for throttling control. Fails without side effects
    /// when the sensor is already known, binds a cooling device missing from
    /// `cdev_info_map` (in any profile), or binds nothing at all.
    pub fn register_throttling(
        &self,
        sensor: &str,
        info: &ThrottlingInfo,
        cdev_info_map: &CdevInfoMap,
    ) -> Result<(), RegisterError> {
        if info.binded_cdev_info_map.is_empty() {
            return Err(RegisterError::NoBindings {
                sensor: sensor.to_string(),
            });
        }
        let all_bindings = std::iter::once(&info.binded_cdev_info_map)
            .chain(info.profile_map.values());
        for bindings in all_bindings {
            for name in bindings.keys() {
                if !cdev_info_map.contains_key(name) {
                    return Err(RegisterError::UnknownCdev {
                        sensor: sensor.to_string(),
                        cdev: name.clone(),
                    });
                }
            }
        }

        let mut statuses = self.sensor_status_map.write().unwrap();
        if statuses.contains_key(sensor) {
            return Err(RegisterError::DuplicateSensor {
                sensor: sensor.to_string(),
            });
        }
        let status = ThrottlingStatus::from_throttling_info(info, cdev_info_map);
        for name in status.cdev_status_map.keys() {
            self.registry.register_voter(name);
        }
        info!(
            "registered sensor {sensor} with {} cooling devices",
            status.cdev_status_map.len()
        );
        statuses.insert(sensor.to_string(), status);
        Ok(())
    }

    /// Reset a sensor's PID memory and zero its per-device requests; the
    /// sensor's registry votes drop to 0. Registration itself persists.
    pub fn clear_throttling_data(&self, sensor: &str) {
        let mut statuses = self.sensor_status_map.write().unwrap();
        let Some(status) = statuses.get_mut(sensor) else {
            return;
        };
        for (name, last_request) in &status.cdev_status_map {
            if *last_request != 0 {
                self.registry.update_vote(name, *last_request, 0);
            }
        }
        status.clear();
        debug!("cleared throttling data for sensor {sensor}");
    }

    /// Run one control tick for `sensor`: PID budget, excluded-rail
    /// deduction, allocation, then the hard-limit and release paths.
    ///
    /// `time_elapsed` is the interval since the previous tick; `max_throttling`
    /// forces the budget to the severity's floor and disables slew limiting.
    #[allow(clippy::too_many_arguments)]
    pub fn throttling_update(
        &self,
        sensor: &str,
        temp: f32,
        curr_severity: ThrottlingSeverity,
        time_elapsed: Duration,
        sensor_info: &SensorInfo,
        power_status_map: &PowerStatusMap,
        cdev_info_map: &CdevInfoMap,
        max_throttling: bool,
        sensor_predictions: &[f32],
    ) {
        let Some(info) = sensor_info.throttling_info.as_ref() else {
            return;
        };
        let mut statuses = self.sensor_status_map.write().unwrap();
        let Some(status) = statuses.get_mut(sensor) else {
            return;
        };

        self.refresh_profile(sensor, status, info);

        if !status.pid_power_budget_map.is_empty() {
            let budget = pid::update_power_budget(
                status,
                sensor,
                temp,
                sensor_info,
                cdev_info_map,
                time_elapsed,
                curr_severity,
                max_throttling,
                sensor_predictions,
                &self.registry,
            );
            // An infinite budget means "not throttling": leave the previous
            // allocation untouched
            if budget.is_finite() {
                let budget =
                    pid::excluded_power_adjustment(info, curr_severity, power_status_map, budget);
                if !allocator::allocate_power_to_cdev(
                    status,
                    sensor,
                    sensor_info,
                    curr_severity,
                    budget,
                    power_status_map,
                    cdev_info_map,
                    max_throttling,
                    &self.registry,
                ) {
                    warn!("{sensor}: power allocation failed, zeroing PID requests");
                    for request in status.pid_cdev_request_map.values_mut() {
                        *request = 0;
                    }
                }
            }
        }

        if !status.hardlimit_cdev_request_map.is_empty() {
            release::update_hard_limit_requests(status, info, curr_severity);
        }
        if !status.throttling_release_map.is_empty() {
            release::update_release_steps(
                status,
                sensor,
                info,
                curr_severity,
                power_status_map,
                cdev_info_map,
            );
        }
    }

    /// Fuse this sensor's request paths into final per-device requests,
    /// update its registry votes, and report the devices whose effective
    /// (max) state changed. `stats` is told about every per-sensor request
    /// change, after all locks are released.
    pub fn compute_cooling_devices_request(
        &self,
        sensor: &str,
        sensor_info: &SensorInfo,
        curr_severity: ThrottlingSeverity,
        cdev_info_map: &CdevInfoMap,
        stats: &dyn RequestStatsSink,
    ) -> Vec<String> {
        let Some(info) = sensor_info.throttling_info.as_ref() else {
            return Vec::new();
        };
        let changes = {
            let mut statuses = self.sensor_status_map.write().unwrap();
            let Some(status) = statuses.get_mut(sensor) else {
                return Vec::new();
            };
            combine::compute_requests(status, info, curr_severity, cdev_info_map, &self.registry)
        };

        let mut changed = Vec::new();
        for change in changes {
            stats.update_cdev_request(sensor, &change.cdev, change.state);
            if change.max_changed {
                changed.push(change.cdev);
            }
        }
        changed
    }

    /// Effective (max) request for a cooling device, or `None` when no
    /// registered sensor binds it.
    pub fn get_cdev_max_request(&self, cdev: &str) -> Option<i32> {
        self.registry.max_request(cdev)
    }

    /// Snapshot of a sensor's mutable state, for dumps and tooling.
    pub fn get_throttling_status(&self, sensor: &str) -> Option<ThrottlingStatus> {
        self.sensor_status_map.read().unwrap().get(sensor).cloned()
    }

    fn refresh_profile(&self, sensor: &str, status: &mut ThrottlingStatus, info: &ThrottlingInfo) {
        let requested = self.profile_source.profile_for(sensor).unwrap_or_default();
        let resolved = if !requested.is_empty() && info.profile_map.contains_key(&requested) {
            requested
        } else {
            String::new()
        };
        if resolved != status.profile {
            info!(
                "{sensor}: binding profile changed '{}' -> '{}'",
                status.profile, resolved
            );
            status.profile = resolved;
        }
    }
}
