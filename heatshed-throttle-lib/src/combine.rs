//! Request fusion and change reporting.
//!
//! Per sensor, per cooling device: the PID and hard-limit requests are fused
//! (max wins), the release step is deducted, and the result is clamped into
//! the binding's floor/ceiling window. The sensor's vote in the registry is
//! then updated, and devices whose registry max moved are reported so the
//! caller can push new states to the actuators.

use crate::config::{CdevInfoMap, ThrottlingInfo};
use crate::profile::binding_for;
use crate::registry::CdevVoteRegistry;
use crate::severity::ThrottlingSeverity;
use crate::status::ThrottlingStatus;

/// Telemetry sink for per-sensor request changes.
pub trait RequestStatsSink {
    fn update_cdev_request(&self, sensor: &str, cdev: &str, state: i32);
}

/// Discard stats.
impl RequestStatsSink for () {
    fn update_cdev_request(&self, _sensor: &str, _cdev: &str, _state: i32) {}
}

/// One device whose combined request changed this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestChange {
    pub cdev: String,
    pub state: i32,
    /// Whether the registry max moved, i.e. the actuator must be updated.
    pub max_changed: bool,
}

/// Fuse the three request paths for every device this sensor votes on and
/// update the vote registry. Returns the changes, oldest binding first.
pub(crate) fn compute_requests(
    status: &mut ThrottlingStatus,
    info: &ThrottlingInfo,
    curr_severity: ThrottlingSeverity,
    cdev_info_map: &CdevInfoMap,
    registry: &CdevVoteRegistry,
) -> Vec<RequestChange> {
    let mut changes = Vec::new();
    let ThrottlingStatus {
        profile,
        pid_cdev_request_map,
        hardlimit_cdev_request_map,
        throttling_release_map,
        cdev_status_map,
        ..
    } = status;

    for (name, last_request) in cdev_status_map.iter_mut() {
        let Some(binding) = binding_for(info, profile, name) else {
            continue;
        };
        let Some(cdev) = cdev_info_map.get(name.as_str()) else {
            continue;
        };

        let pid = pid_cdev_request_map.get(name.as_str()).copied().unwrap_or(0);
        let hard = hardlimit_cdev_request_map
            .get(name.as_str())
            .copied()
            .unwrap_or(0);
        let release = throttling_release_map
            .get(name.as_str())
            .copied()
            .unwrap_or(0);

        let mut request = pid.max(hard);
        if release != 0 {
            // A negative release adds throttle on top of the fused request
            request = if release >= request {
                0
            } else {
                request - release
            };
            request = request.max(binding.cdev_floor_with_power_link[curr_severity]);
        }
        request = request.min(binding.ceiling(cdev, curr_severity));

        if request != *last_request {
            let max_changed = registry.update_vote(name, *last_request, request);
            *last_request = request;
            changes.push(RequestChange {
                cdev: name.clone(),
                state: request,
                max_changed,
            });
        }
    }

    changes
}
