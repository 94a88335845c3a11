//! Read-only configuration model for sensors, cooling devices, and their
//! bindings.
//!
//! These types are frozen at registration time; the control loop never
//! mutates them. Parsing and schema validation happen upstream; the serde
//! derives here exist so host tooling and tests can load scenarios directly.
//!
//! Float tables use IEEE NaN as the "not configured" marker, which the PID
//! math consumes without translation. Everything mutable lives in
//! [`crate::status::ThrottlingStatus`] instead.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;

use crate::severity::{PerSeverity, ThrottlingSeverity};

/// Serde adapter for NaN-bearing float tables: JSON `null` maps to NaN and
/// back, since JSON has no NaN literal.
mod float_table {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::severity::{PerSeverity, SEVERITY_COUNT};

    pub fn serialize<S: Serializer>(
        table: &PerSeverity<f32>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let values: [Option<f32>; SEVERITY_COUNT] =
            table.0.map(|v| if v.is_nan() { None } else { Some(v) });
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<PerSeverity<f32>, D::Error> {
        let values = <[Option<f32>; SEVERITY_COUNT]>::deserialize(deserializer)?;
        Ok(PerSeverity(values.map(|v| v.unwrap_or(f32::NAN))))
    }
}

/// Deserialize an optional float where `null`/absent means NaN.
fn de_maybe_f32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

/// Static description of one cooling device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdevInfo {
    /// Power draw (mW) at each state, state 0 first. Monotonic non-increasing.
    pub state2power: Vec<f32>,
    /// Deepest throttling state the device supports.
    pub max_state: i32,
}

impl CdevInfo {
    /// Power at `state`, clamped into the table's valid range.
    #[must_use]
    pub fn state_power(&self, state: i32) -> f32 {
        let idx = state.clamp(0, self.max_state.max(0)) as usize;
        self.state2power.get(idx).copied().unwrap_or(0.0)
    }
}

/// Latest averaged power reading for one rail. NaN while the reader is still
/// warming up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerStatus {
    pub last_updated_avg_power: f32,
}

pub type CdevInfoMap = IndexMap<String, CdevInfo>;
pub type PowerStatusMap = IndexMap<String, PowerStatus>;
pub type BindedCdevInfoMap = IndexMap<String, BindedCdevInfo>;

/// How a cooling device's release step reacts to rail power vs threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseLogic {
    #[default]
    None,
    Increase,
    Decrease,
    Stepwise,
    ReleaseToFloor,
}

/// Per (sensor, cooling device) binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindedCdevInfo {
    /// PID allocation weight per severity. NaN excludes the device from PID
    /// at that severity.
    #[serde(default = "nan_table", with = "float_table")]
    pub cdev_weight_for_pid: PerSeverity<f32>,
    /// Table-driven hard-limit state per severity. 0 means no hard limit.
    #[serde(default)]
    pub limit_info: PerSeverity<i32>,
    /// Highest state requests may reach per severity. 0 means unconstrained
    /// (normalized to the device's `max_state` when consulted).
    #[serde(default)]
    pub cdev_ceiling: PerSeverity<i32>,
    /// Lowest state the release path may drop to per severity.
    #[serde(default)]
    pub cdev_floor_with_power_link: PerSeverity<i32>,
    /// Rail whose measured power steers allocation and release for this
    /// device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_rail: Option<String>,
    /// Release threshold (mW) per severity, NaN where not evaluated.
    #[serde(default = "nan_table", with = "float_table")]
    pub power_thresholds: PerSeverity<f32>,
    /// Inverts the threshold comparison: when true, "over budget" means the
    /// rail draws at or *below* the threshold.
    #[serde(default)]
    pub high_power_check: bool,
    #[serde(default)]
    pub release_logic: ReleaseLogic,
    /// Max state increase per tick. `i32::MAX` means uncapped.
    #[serde(default = "uncapped_step")]
    pub max_throttle_step: i32,
    /// Max state decrease per tick. `i32::MAX` means uncapped.
    #[serde(default = "uncapped_step")]
    pub max_release_step: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Device throttles in lockstep with its rail; allocation must not run
    /// without valid rail data.
    #[serde(default)]
    pub throttling_with_power_link: bool,
}

impl BindedCdevInfo {
    /// Effective ceiling at `severity`, with 0 / out-of-range entries
    /// normalized to the device's deepest state.
    #[must_use]
    pub fn ceiling(&self, cdev: &CdevInfo, severity: ThrottlingSeverity) -> i32 {
        let ceiling = self.cdev_ceiling[severity];
        if ceiling <= 0 || ceiling > cdev.max_state {
            cdev.max_state
        } else {
            ceiling
        }
    }
}

impl Default for BindedCdevInfo {
    fn default() -> Self {
        Self {
            cdev_weight_for_pid: nan_table(),
            limit_info: PerSeverity::default(),
            cdev_ceiling: PerSeverity::default(),
            cdev_floor_with_power_link: PerSeverity::default(),
            power_rail: None,
            power_thresholds: nan_table(),
            high_power_check: false,
            release_logic: ReleaseLogic::None,
            max_throttle_step: uncapped_step(),
            max_release_step: uncapped_step(),
            enabled: true,
            throttling_with_power_link: false,
        }
    }
}

/// PID gain tables and binding sets for one controlled sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingInfo {
    /// Available power at zero error, per severity. NaN marks severities the
    /// controller has no table for.
    #[serde(default = "nan_table", with = "float_table")]
    pub s_power: PerSeverity<f32>,
    /// Proportional gain when over the setpoint (error negative).
    #[serde(default, with = "float_table")]
    pub k_po: PerSeverity<f32>,
    /// Proportional gain when under the setpoint.
    #[serde(default, with = "float_table")]
    pub k_pu: PerSeverity<f32>,
    /// Integral gain when over the setpoint.
    #[serde(default, with = "float_table")]
    pub k_io: PerSeverity<f32>,
    /// Integral gain when under the setpoint.
    #[serde(default, with = "float_table")]
    pub k_iu: PerSeverity<f32>,
    #[serde(default, with = "float_table")]
    pub k_d: PerSeverity<f32>,
    /// Integral magnitude clamp. NaN leaves the integral unbounded.
    #[serde(default = "nan_table", with = "float_table")]
    pub i_max: PerSeverity<f32>,
    /// Errors at or above this stop integral accumulation.
    #[serde(default = "nan_table", with = "float_table")]
    pub i_cutoff: PerSeverity<f32>,
    #[serde(default = "nan_table", with = "float_table")]
    pub min_alloc_power: PerSeverity<f32>,
    #[serde(default = "nan_table", with = "float_table")]
    pub max_alloc_power: PerSeverity<f32>,
    /// Integral seed on the first tick.
    #[serde(default)]
    pub i_default: f32,
    /// Integral seed as a percentage of the maximum attainable cooling-device
    /// power; overrides `i_default` when non-NaN.
    #[serde(default = "f32_nan", deserialize_with = "de_maybe_f32")]
    pub i_default_pct: f32,
    /// Setpoint-transient smoothing length in ticks.
    #[serde(default)]
    pub tran_cycle: u32,
    /// Default binding set.
    pub binded_cdev_info_map: BindedCdevInfoMap,
    /// Named alternate binding sets, selectable at runtime.
    #[serde(default)]
    pub profile_map: IndexMap<String, BindedCdevInfoMap>,
    /// Rail power subtracted from the budget, weighted per severity.
    #[serde(default)]
    pub excluded_power_info_map: IndexMap<String, PerSeverity<f32>>,
}

impl Default for ThrottlingInfo {
    fn default() -> Self {
        Self {
            s_power: nan_table(),
            k_po: PerSeverity::default(),
            k_pu: PerSeverity::default(),
            k_io: PerSeverity::default(),
            k_iu: PerSeverity::default(),
            k_d: PerSeverity::default(),
            i_max: nan_table(),
            i_cutoff: nan_table(),
            min_alloc_power: nan_table(),
            max_alloc_power: nan_table(),
            i_default: 0.0,
            i_default_pct: f32::NAN,
            tran_cycle: 0,
            binded_cdev_info_map: BindedCdevInfoMap::new(),
            profile_map: IndexMap::new(),
            excluded_power_info_map: IndexMap::new(),
        }
    }
}

/// Optional predictive feed-forward block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorInfo {
    #[serde(default)]
    pub support_pid_compensation: bool,
    /// Weight for each prediction sample.
    #[serde(default)]
    pub prediction_weights: SmallVec<[f32; 8]>,
    /// Compensation gain per severity.
    #[serde(default = "nan_table", with = "float_table")]
    pub k_p_compensate: PerSeverity<f32>,
}

/// Read-only description of one temperature sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Temperature setpoint per severity.
    #[serde(default = "nan_table", with = "float_table")]
    pub hot_thresholds: PerSeverity<f32>,
    /// Raw-reading scale factor, also applied to prediction samples.
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictor_info: Option<PredictorInfo>,
    /// Present for sensors under closed-loop control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling_info: Option<ThrottlingInfo>,
}

impl Default for SensorInfo {
    fn default() -> Self {
        Self {
            hot_thresholds: nan_table(),
            multiplier: default_multiplier(),
            predictor_info: None,
            throttling_info: None,
        }
    }
}

fn nan_table() -> PerSeverity<f32> {
    PerSeverity::splat(f32::NAN)
}

const fn f32_nan() -> f32 {
    f32::NAN
}

const fn uncapped_step() -> i32 {
    i32::MAX
}

const fn default_true() -> bool {
    true
}

const fn default_multiplier() -> f32 {
    1.0
}
