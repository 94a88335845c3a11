//! Replay a recorded temperature/power trace through the throttling core.
//!
//! Takes a JSON scenario (cooling device table, sensor configs, tick
//! samples), drives each tick through the controller exactly the way the
//! on-device loop would, and prints the resulting budgets, per-device
//! requests, and vote-registry maxima.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use heatshed_throttle_lib::{
    CdevInfoMap, PowerStatus, PowerStatusMap, ProfileSource, SensorInfo, ThrottlingController,
    ThrottlingSeverity,
};

/// Replay HeatShed throttling scenarios from a JSON trace.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the scenario JSON file.
    file: PathBuf,

    /// Emit one JSON object per tick instead of the table.
    #[arg(long)]
    json: bool,

    /// Maximum number of ticks to replay.
    #[arg(short = 'n', long)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    cdevs: CdevInfoMap,
    sensors: Vec<SensorEntry>,
    ticks: Vec<Tick>,
}

#[derive(Debug, Deserialize)]
struct SensorEntry {
    name: String,
    #[serde(flatten)]
    info: SensorInfo,
}

#[derive(Debug, Deserialize)]
struct Tick {
    /// Sensor this sample belongs to; defaults to the first configured one.
    #[serde(default)]
    sensor: Option<String>,
    temp: f32,
    severity: ThrottlingSeverity,
    #[serde(default = "default_dt_ms")]
    dt_ms: u64,
    /// Measured rail power for this tick; rails absent here read as NaN.
    #[serde(default)]
    rail_power: HashMap<String, f32>,
    #[serde(default)]
    max_throttling: bool,
    #[serde(default)]
    predictions: Vec<f32>,
    /// Binding profile to activate before this tick.
    #[serde(default)]
    profile: Option<String>,
}

const fn default_dt_ms() -> u64 {
    100
}

/// Profile source fed from the trace's per-tick `profile` fields.
#[derive(Clone, Default)]
struct TraceProfiles(Arc<Mutex<HashMap<String, String>>>);

impl ProfileSource for TraceProfiles {
    fn profile_for(&self, sensor: &str) -> Option<String> {
        self.0.lock().unwrap().get(sensor).cloned()
    }
}

fn main() {
    let args = Args::parse();

    let file = match File::open(&args.file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening {}: {e}", args.file.display());
            std::process::exit(1);
        }
    };
    let scenario: Scenario = match serde_json::from_reader(BufReader::new(file)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Invalid scenario file: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = replay(&args, &scenario) {
        eprintln!("Replay failed: {e}");
        std::process::exit(1);
    }
}

fn replay(args: &Args, scenario: &Scenario) -> Result<()> {
    let profiles = TraceProfiles::default();
    let controller = ThrottlingController::new(profiles.clone());

    let mut sensor_infos: HashMap<&str, &SensorInfo> = HashMap::new();
    for entry in &scenario.sensors {
        let info = entry
            .info
            .throttling_info
            .as_ref()
            .with_context(|| format!("sensor {} has no throttling_info", entry.name))?;
        controller
            .register_throttling(&entry.name, info, &scenario.cdevs)
            .with_context(|| format!("registering sensor {}", entry.name))?;
        sensor_infos.insert(entry.name.as_str(), &entry.info);
    }
    let default_sensor = scenario
        .sensors
        .first()
        .context("scenario has no sensors")?
        .name
        .clone();

    if !args.json {
        println!(
            "{:>5}  {:<10}  {:>7}  {:<9}  {:>9}  {:<24}  Max votes",
            "#", "Sensor", "Temp", "Severity", "Budget", "Requests"
        );
        println!("{}", "-".repeat(96));
    }

    let limit = args.limit.unwrap_or(scenario.ticks.len());
    for (index, tick) in scenario.ticks.iter().take(limit).enumerate() {
        let sensor = tick.sensor.as_deref().unwrap_or(&default_sensor);
        let sensor_info = *sensor_infos
            .get(sensor)
            .with_context(|| format!("tick {index} names unknown sensor {sensor}"))?;

        if let Some(profile) = &tick.profile {
            profiles
                .0
                .lock()
                .unwrap()
                .insert(sensor.to_string(), profile.clone());
        }

        let power_status_map: PowerStatusMap = tick
            .rail_power
            .iter()
            .map(|(rail, &power)| {
                (
                    rail.clone(),
                    PowerStatus {
                        last_updated_avg_power: power,
                    },
                )
            })
            .collect();

        controller.throttling_update(
            sensor,
            tick.temp,
            tick.severity,
            Duration::from_millis(tick.dt_ms),
            sensor_info,
            &power_status_map,
            &scenario.cdevs,
            tick.max_throttling,
            &tick.predictions,
        );
        let changed = controller.compute_cooling_devices_request(
            sensor,
            sensor_info,
            tick.severity,
            &scenario.cdevs,
            &(),
        );

        let status = controller
            .get_throttling_status(sensor)
            .context("sensor vanished mid-replay")?;

        if args.json {
            let line = serde_json::json!({
                "tick": index,
                "sensor": sensor,
                "temp": tick.temp,
                "severity": tick.severity,
                "changed": changed,
                "status": status,
                "max_requests": max_requests(&controller, &scenario.cdevs),
            });
            println!("{line}");
        } else {
            let budget = status
                .prev_power_budget
                .map_or_else(|| "-".to_string(), |b| format!("{b:.0}"));
            let requests = status
                .cdev_status_map
                .iter()
                .map(|(name, state)| format!("{name}={state}"))
                .collect::<Vec<_>>()
                .join(" ");
            let maxima = max_requests(&controller, &scenario.cdevs)
                .into_iter()
                .map(|(name, state)| {
                    let mark = if changed.contains(&name) { "*" } else { "" };
                    format!("{name}={state}{mark}")
                })
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "{index:>5}  {sensor:<10}  {:>7.1}  {:<9}  {budget:>9}  {requests:<24}  {maxima}",
                tick.temp,
                tick.severity.to_string(),
            );
        }
    }

    if limit < scenario.ticks.len() && !args.json {
        println!("... {} more ticks not shown", scenario.ticks.len() - limit);
    }
    Ok(())
}

/// Current effective request per cooling device, in config order.
fn max_requests(controller: &ThrottlingController, cdevs: &CdevInfoMap) -> Vec<(String, i32)> {
    cdevs
        .keys()
        .filter_map(|name| {
            controller
                .get_cdev_max_request(name)
                .map(|state| (name.clone(), state))
        })
        .collect()
}
