//! Vehicle State Store (C3)
//!
//! Single source of truth for engine and vehicle scalars plus the DTC
//! list. A single mutex protects the aggregate; readers hold it only long
//! enough to clone a [`Snapshot`] (§5 "snapshot-on-read").

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub rpm: f32,
    pub coolant_temp: f32,
    pub oil_temp: f32,
    pub intake_air_temp: f32,
    pub engine_load: f32,
    pub throttle_position: f32,
    pub maf_flow: f32,
    pub fuel_pressure: f32,
    pub timing_advance: f32,
    pub is_running: bool,
    pub runtime_since_start: u16,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            rpm: 800.0,
            coolant_temp: 20.0,
            oil_temp: 25.0,
            intake_air_temp: 20.0,
            engine_load: 15.0,
            throttle_position: 0.0,
            maf_flow: 2.5,
            fuel_pressure: 3.5,
            timing_advance: 15.0,
            is_running: true,
            runtime_since_start: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleState {
    pub speed: f32,
    pub odometer: f64,
    pub fuel_level: f32,
    pub battery_voltage: f32,
    pub ambient_temperature: f32,
    pub barometric_pressure: f32,
    pub gear: u8,
    pub speed_limit: u16,
    pub mil_status: bool,
    pub dtc_count: u8,
    pub fuel_system_status: u8,
    pub o2_sensor1_voltage: f32,
    pub o2_sensor2_voltage: f32,
    pub short_fuel_trim_bank1: f32,
    pub long_fuel_trim_bank1: f32,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            speed: 0.0,
            // Seeded non-zero per the source simulator's default, not a
            // protocol requirement.
            odometer: 12345.6,
            fuel_level: 75.0,
            battery_voltage: 12.6,
            ambient_temperature: 20.0,
            barometric_pressure: 101.0,
            gear: 0,
            speed_limit: 50,
            mil_status: false,
            dtc_count: 0,
            fuel_system_status: 2,
            o2_sensor1_voltage: 0.45,
            o2_sensor2_voltage: 0.47,
            short_fuel_trim_bank1: 0.0,
            long_fuel_trim_bank1: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    Pending,
    Confirmed,
    Permanent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticTroubleCode {
    pub code: String,
    pub description: String,
    pub status: DtcStatus,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub occurrence_count: u32,
}

/// A fixed catalog of injectable fault codes, paired with their
/// human-readable description (§4.4.1 "Random DTC injection").
pub const DTC_CATALOG: &[(&str, &str)] = &[
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0420", "Catalyst System Efficiency Below Threshold"),
    ("P0442", "Evaporative Emission System Leak Detected (small leak)"),
    ("P0128", "Coolant Thermostat Below Regulating Temperature"),
    ("C0035", "Left Front Wheel Speed Sensor Circuit"),
    ("B0001", "Driver Frontal Deactivation Switch Circuit"),
    ("U0100", "Lost Communication With ECM/PCM"),
];

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub engine: EngineState,
    pub vehicle: VehicleState,
    pub dtc_codes: Vec<DiagnosticTroubleCode>,
    pub scenario: String,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub messages_sent: AtomicU64,
    pub requests_received: AtomicU64,
    pub responses_sent: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub errors: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

struct Aggregate {
    engine: EngineState,
    vehicle: VehicleState,
    dtcs: Vec<DiagnosticTroubleCode>,
    scenario: String,
}

impl Aggregate {
    /// Keep `dtc_count`/`mil_status` in lockstep with the DTC list (§3
    /// invariants). Called after every mutation that touches `dtcs`.
    fn recompute_dtc_derived(&mut self) {
        let confirmed = self
            .dtcs
            .iter()
            .filter(|d| d.status == DtcStatus::Confirmed)
            .count();
        self.vehicle.dtc_count = confirmed.min(u8::MAX as usize) as u8;
        self.vehicle.mil_status = confirmed > 0;
    }
}

/// Single source of truth for engine/vehicle scalars and the DTC list.
pub struct StateStore {
    inner: Mutex<Aggregate>,
    pub stats: Stats,
}

impl StateStore {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Aggregate {
                engine: EngineState::default(),
                vehicle: VehicleState::default(),
                dtcs: Vec::new(),
                scenario: scenario.into(),
            }),
            stats: Stats::default(),
        }
    }

    /// Atomic copy of the full state, taken under the lock just long
    /// enough to clone (§4.3, §5).
    pub fn read_snapshot(&self) -> Snapshot {
        let guard = self.inner.lock();
        Snapshot {
            engine: guard.engine.clone(),
            vehicle: guard.vehicle.clone(),
            dtc_codes: guard.dtcs.clone(),
            scenario: guard.scenario.clone(),
        }
    }

    /// Writer entry point for the engine/physics tick: the closure gets
    /// exclusive mutable access to both scalar blocks.
    pub fn apply(&self, f: impl FnOnce(&mut EngineState, &mut VehicleState)) {
        let mut guard = self.inner.lock();
        let Aggregate { engine, vehicle, .. } = &mut *guard;
        f(engine, vehicle);
    }

    pub fn set_scenario(&self, scenario: impl Into<String>) {
        let mut guard = self.inner.lock();
        guard.scenario = scenario.into();
    }

    /// Mode-04: clear the DTC list and MIL unconditionally (§4.5, §7 —
    /// always acknowledged successfully even if already empty).
    pub fn clear_dtcs(&self) {
        let mut guard = self.inner.lock();
        guard.dtcs.clear();
        guard.recompute_dtc_derived();
    }

    /// Confirmed DTCs only, oldest-first, for the mode-03 response (§4.5).
    pub fn confirmed_dtcs(&self) -> Vec<DiagnosticTroubleCode> {
        let guard = self.inner.lock();
        guard
            .dtcs
            .iter()
            .filter(|d| d.status == DtcStatus::Confirmed)
            .cloned()
            .collect()
    }

    /// Random DTC injection (§4.4.1): if `code` is already present, bump
    /// its occurrence count and `last_detected`; otherwise append it
    /// `pending`, optionally promoted to `confirmed` immediately.
    pub fn inject_dtc(&self, code: &str, description: &str, promote: bool, now: DateTime<Utc>) {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.dtcs.iter_mut().find(|d| d.code == code) {
            existing.occurrence_count += 1;
            existing.last_detected = now;
        } else {
            guard.dtcs.push(DiagnosticTroubleCode {
                code: code.to_string(),
                description: description.to_string(),
                status: if promote {
                    DtcStatus::Confirmed
                } else {
                    DtcStatus::Pending
                },
                first_detected: now,
                last_detected: now,
                occurrence_count: 1,
            });
        }
        guard.recompute_dtc_derived();
    }

    pub fn active_dtc_count(&self) -> usize {
        self.inner.lock().dtcs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn mil_tracks_confirmed_dtcs() {
        let store = StateStore::new("idle");
        assert!(!store.read_snapshot().vehicle.mil_status);

        store.inject_dtc("P0301", "Cylinder 1 Misfire Detected", true, now());
        let snap = store.read_snapshot();
        assert!(snap.vehicle.mil_status);
        assert_eq!(snap.vehicle.dtc_count, 1);

        store.clear_dtcs();
        let snap = store.read_snapshot();
        assert!(!snap.vehicle.mil_status);
        assert_eq!(snap.vehicle.dtc_count, 0);
    }

    #[test]
    fn pending_dtc_does_not_set_mil() {
        let store = StateStore::new("idle");
        store.inject_dtc("P0171", "System Too Lean (Bank 1)", false, now());
        let snap = store.read_snapshot();
        assert!(!snap.vehicle.mil_status);
        assert_eq!(snap.vehicle.dtc_count, 0);
        assert_eq!(store.active_dtc_count(), 1);
    }

    #[test]
    fn repeated_injection_bumps_occurrence_count() {
        let store = StateStore::new("idle");
        store.inject_dtc("P0301", "Cylinder 1 Misfire Detected", true, now());
        store.inject_dtc("P0301", "Cylinder 1 Misfire Detected", true, now());
        assert_eq!(store.active_dtc_count(), 1);
        let snap = store.read_snapshot();
        assert_eq!(snap.dtc_codes[0].occurrence_count, 2);
    }

    #[test]
    fn apply_mutates_under_lock() {
        let store = StateStore::new("idle");
        store.apply(|engine, vehicle| {
            engine.rpm = 3000.0;
            vehicle.speed = 80.0;
        });
        let snap = store.read_snapshot();
        assert_eq!(snap.engine.rpm, 3000.0);
        assert_eq!(snap.vehicle.speed, 80.0);
    }

    #[test]
    fn stats_increment_independently() {
        let store = StateStore::new("idle");
        store.stats.inc_requests_received();
        store.stats.inc_responses_sent();
        store.stats.inc_responses_sent();
        store.stats.inc_errors();
        let s = store.stats.snapshot();
        assert_eq!(s.requests_received, 1);
        assert_eq!(s.responses_sent, 2);
        assert_eq!(s.errors, 1);
    }
}
