//! Scenario strategy (§4.4.1): weighted-random scenario selection driving
//! a statistical model of engine/vehicle sensors.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::{gauss, Engine};
use crate::state::{EngineState, StateStore, VehicleState, DTC_CATALOG};

const MIN_RESELECT_SECS: f32 = 30.0;
const MAX_RESELECT_SECS: f32 = 120.0;
const TICK_HZ: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Idle,
    City,
    Highway,
    Aggressive,
    Eco,
    Parking,
    TrafficJam,
}

impl Scenario {
    const ALL: [Scenario; 7] = [
        Scenario::Idle,
        Scenario::City,
        Scenario::Highway,
        Scenario::Aggressive,
        Scenario::Eco,
        Scenario::Parking,
        Scenario::TrafficJam,
    ];

    fn weight(self) -> u32 {
        match self {
            Scenario::Idle => 20,
            Scenario::City => 35,
            Scenario::Highway => 20,
            Scenario::Aggressive => 5,
            Scenario::Eco => 10,
            Scenario::Parking => 5,
            Scenario::TrafficJam => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Scenario::Idle => "idle",
            Scenario::City => "city",
            Scenario::Highway => "highway",
            Scenario::Aggressive => "aggressive",
            Scenario::Eco => "eco",
            Scenario::Parking => "parking",
            Scenario::TrafficJam => "traffic_jam",
        }
    }
}

/// speed (km/h) -> gear bin, per the scenario strategy's gear model.
fn gear_for_speed(speed: f32) -> u8 {
    if speed < 20.0 {
        1
    } else if speed < 40.0 {
        2
    } else if speed < 60.0 {
        3
    } else if speed < 80.0 {
        4
    } else if speed < 110.0 {
        5
    } else {
        6
    }
}

/// speed + gear -> engine RPM, per the scenario strategy's gear model
/// (final drive 3.73, wheel circumference 2.07 m).
fn rpm_for_gear(speed: f32, gear: u8) -> f32 {
    let ratio = match gear {
        1 => 3.5,
        2 => 2.1,
        3 => 1.4,
        4 => 1.0,
        5 => 0.8,
        6 => 0.65,
        _ => 1.0,
    };
    const FINAL_DRIVE: f32 = 3.73;
    const WHEEL_CIRCUMFERENCE_M: f32 = 2.07;
    let wheel_rpm = (speed * 1000.0 / 60.0) / WHEEL_CIRCUMFERENCE_M;
    (wheel_rpm * ratio * FINAL_DRIVE).clamp(800.0, 7000.0)
}

pub struct ScenarioEngine {
    rng: StdRng,
    current: Scenario,
    /// Drawn whenever `current` becomes `Parking`: true means the driver
    /// switched the ignition off for this stop (§4.4.1 "if running → idle
    /// else all zeros").
    parked_engine_off: bool,
    tick_count: u64,
    next_reselect_tick: u64,
    inject_dtc_enabled: bool,
}

impl ScenarioEngine {
    pub fn new(seed: Option<u64>, inject_dtc_enabled: bool) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let current = Self::weighted_sample(&mut rng, None);
        let parked_engine_off = current == Scenario::Parking && rng.gen_bool(0.5);
        let next_reselect_tick = Self::reselect_interval_ticks(&mut rng);
        Self {
            rng,
            current,
            parked_engine_off,
            tick_count: 0,
            next_reselect_tick,
            inject_dtc_enabled,
        }
    }

    fn reselect_interval_ticks(rng: &mut StdRng) -> u64 {
        let secs = rng.gen_range(MIN_RESELECT_SECS..=MAX_RESELECT_SECS);
        (secs * TICK_HZ) as u64
    }

    /// Weighted sample over every scenario except `exclude` (or over all
    /// of them, at startup, when there is no current scenario yet).
    fn weighted_sample(rng: &mut StdRng, exclude: Option<Scenario>) -> Scenario {
        let candidates: Vec<Scenario> = Scenario::ALL
            .iter()
            .copied()
            .filter(|s| Some(*s) != exclude)
            .collect();
        let total_weight: u32 = candidates.iter().map(|s| s.weight()).sum();
        let mut roll = rng.gen_range(0..total_weight);
        for scenario in candidates {
            let w = scenario.weight();
            if roll < w {
                return scenario;
            }
            roll -= w;
        }
        unreachable!("roll is bounded by total_weight")
    }

    fn maybe_reselect(&mut self) {
        if self.tick_count < self.next_reselect_tick {
            return;
        }
        let chosen = Self::weighted_sample(&mut self.rng, Some(self.current));
        info!(from = self.current.label(), to = chosen.label(), "scenario reselected");
        self.current = chosen;
        self.parked_engine_off = chosen == Scenario::Parking && self.rng.gen_bool(0.5);
        self.next_reselect_tick = self.tick_count + Self::reselect_interval_ticks(&mut self.rng);
    }

    fn apply_idle(&mut self, engine: &mut EngineState, vehicle: &mut VehicleState) {
        vehicle.speed = 0.0;
        vehicle.gear = 0;
        engine.rpm = (800.0 + gauss(&mut self.rng, 0.0, 30.0)).clamp(800.0, 7000.0);
        engine.throttle_position = 0.0;
        engine.engine_load = self.rng.gen_range(15.0..25.0);
        engine.maf_flow = self.rng.gen_range(2.0..4.0);
    }

    fn apply_scenario(&mut self, t: f64, engine: &mut EngineState, vehicle: &mut VehicleState) {
        match self.current {
            Scenario::Idle => self.apply_idle(engine, vehicle),
            Scenario::City => {
                let speed = (40.0 + 15.0 * (0.01 * t).sin() as f32 + gauss(&mut self.rng, 0.0, 5.0)).max(0.0);
                vehicle.speed = speed;
                vehicle.speed_limit = *[40u16, 50, 60].get(self.rng.gen_range(0..3)).unwrap();
                vehicle.gear = gear_for_speed(speed);
                engine.rpm = rpm_for_gear(speed, vehicle.gear);
                engine.throttle_position = self.rng.gen_range(20.0..60.0);
                engine.engine_load = self.rng.gen_range(30.0..70.0);
                engine.maf_flow = self.rng.gen_range(8.0..25.0);
            }
            Scenario::Highway => {
                let speed = 110.0 + 10.0 * (0.005 * t).sin() as f32 + gauss(&mut self.rng, 0.0, 3.0);
                vehicle.speed = speed.max(0.0);
                vehicle.speed_limit = *[90u16, 110, 130].get(self.rng.gen_range(0..3)).unwrap();
                vehicle.gear = 6;
                engine.rpm = rpm_for_gear(vehicle.speed, 6);
                engine.throttle_position = self.rng.gen_range(40.0..70.0);
                engine.engine_load = self.rng.gen_range(40.0..80.0);
                engine.maf_flow = self.rng.gen_range(15.0..35.0);
            }
            Scenario::Aggressive => {
                let speed = self.rng.gen_range(60.0..140.0);
                vehicle.speed = speed;
                vehicle.gear = gear_for_speed(speed);
                engine.rpm = self.rng.gen_range(3000.0..6500.0);
                engine.throttle_position = self.rng.gen_range(70.0..100.0);
                engine.engine_load = self.rng.gen_range(70.0..95.0);
                engine.maf_flow = self.rng.gen_range(25.0..50.0);
            }
            Scenario::Eco => {
                let speed = self.rng.gen_range(50.0..90.0);
                vehicle.speed = speed;
                vehicle.gear = gear_for_speed(speed);
                engine.rpm = rpm_for_gear(speed, vehicle.gear).min(2500.0);
                engine.throttle_position = self.rng.gen_range(10.0..40.0);
                engine.engine_load = self.rng.gen_range(20.0..50.0);
                engine.maf_flow = self.rng.gen_range(5.0..20.0);
            }
            Scenario::TrafficJam => {
                if self.rng.gen_bool(0.3) {
                    self.apply_idle(engine, vehicle);
                } else {
                    let speed = self.rng.gen_range(5.0..25.0);
                    vehicle.speed = speed;
                    vehicle.gear = gear_for_speed(speed);
                    engine.rpm = rpm_for_gear(speed, vehicle.gear);
                    engine.throttle_position = self.rng.gen_range(10.0..30.0);
                    engine.engine_load = self.rng.gen_range(25.0..45.0);
                    engine.maf_flow = self.rng.gen_range(5.0..15.0);
                }
            }
            Scenario::Parking => {
                if engine.is_running {
                    self.apply_idle(engine, vehicle);
                } else {
                    vehicle.speed = 0.0;
                    vehicle.gear = 0;
                    engine.rpm = 0.0;
                    engine.throttle_position = 0.0;
                    engine.engine_load = 0.0;
                    engine.maf_flow = 0.0;
                }
            }
        }
    }

    fn correlated_updates(&mut self, t: f64, dt_secs: f32, engine: &mut EngineState, vehicle: &mut VehicleState) {
        let mut coolant_target = 85.0 + engine.engine_load / 100.0 * 20.0;
        if vehicle.speed > 50.0 {
            coolant_target -= 5.0;
        }
        engine.coolant_temp = (engine.coolant_temp + (coolant_target - engine.coolant_temp) * 0.01).clamp(-40.0, 215.0);
        engine.oil_temp = (engine.coolant_temp + self.rng.gen_range(5.0..15.0)).clamp(-40.0, 215.0);
        engine.intake_air_temp =
            (vehicle.ambient_temperature + engine.engine_load / 100.0 * 30.0 + gauss(&mut self.rng, 0.0, 3.0))
                .clamp(-40.0, 215.0);
        engine.fuel_pressure = 3.5 + engine.engine_load / 100.0 * 1.5;

        let battery_base = if engine.is_running { 14.2 } else { 12.6 };
        vehicle.battery_voltage = (battery_base + gauss(&mut self.rng, 0.0, 0.2)).clamp(0.0, 65.535);

        let oscillation = 0.1 * (0.2 * t).sin() as f32;
        vehicle.o2_sensor1_voltage = (0.45 + oscillation + gauss(&mut self.rng, 0.0, 0.02)).clamp(0.0, 1.275);
        vehicle.o2_sensor2_voltage = (0.47 + oscillation + gauss(&mut self.rng, 0.0, 0.02)).clamp(0.0, 1.275);

        vehicle.short_fuel_trim_bank1 = gauss(&mut self.rng, 0.0, 3.0).clamp(-100.0, 99.22);
        vehicle.long_fuel_trim_bank1 = gauss(&mut self.rng, 0.0, 5.0).clamp(-100.0, 99.22);

        engine.timing_advance = (15.0 + engine.rpm / 6000.0 * 25.0).clamp(-64.0, 63.5);

        vehicle.odometer += (vehicle.speed as f64 / 3600.0) * dt_secs as f64;
        if engine.is_running {
            vehicle.fuel_level = (vehicle.fuel_level - engine.engine_load / 100.0 * 1e-4).clamp(0.0, 100.0);
        }

        engine.runtime_since_start = engine.runtime_since_start.saturating_add(dt_secs.round() as u16);
    }

    fn maybe_inject_dtc(&mut self, store: &StateStore) {
        if !self.inject_dtc_enabled {
            return;
        }
        if !self.rng.gen_bool(1e-4) {
            return;
        }
        if store.active_dtc_count() >= 5 {
            return;
        }
        let (code, description) = DTC_CATALOG[self.rng.gen_range(0..DTC_CATALOG.len())];
        let promote = self.rng.gen_bool(0.3);
        store.inject_dtc(code, description, promote, Utc::now());
    }
}

impl Engine for ScenarioEngine {
    fn tick(&mut self, store: &StateStore, dt_secs: f32) {
        self.tick_count += 1;
        self.maybe_reselect();
        let t = self.tick_count as f64;
        let is_running = !(self.current == Scenario::Parking && self.parked_engine_off);
        store.apply(|engine, vehicle| {
            engine.is_running = is_running;
            self.apply_scenario(t, engine, vehicle);
            self.correlated_updates(t, dt_secs, engine, vehicle);
        });
        store.set_scenario(self.current.label());
        self.maybe_inject_dtc(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gear_bins_match_documented_ranges() {
        assert_eq!(gear_for_speed(0.0), 1);
        assert_eq!(gear_for_speed(19.9), 1);
        assert_eq!(gear_for_speed(20.0), 2);
        assert_eq!(gear_for_speed(59.9), 3);
        assert_eq!(gear_for_speed(79.9), 4);
        assert_eq!(gear_for_speed(109.9), 5);
        assert_eq!(gear_for_speed(110.0), 6);
    }

    #[test]
    fn rpm_for_gear_stays_in_domain() {
        for speed in (0..200).map(|s| s as f32) {
            let gear = gear_for_speed(speed);
            let rpm = rpm_for_gear(speed, gear);
            assert!((800.0..=7000.0).contains(&rpm));
        }
    }

    #[test]
    fn idle_scenario_keeps_invariants() {
        let store = StateStore::new("idle");
        let mut engine = ScenarioEngine::new(Some(1), false);
        // Force the idle scenario directly rather than relying on the
        // weighted startup draw, so this test stays deterministic.
        engine.current = Scenario::Idle;
        engine.next_reselect_tick = u64::MAX;
        for _ in 0..1000 {
            engine.tick(&store, 0.01);
        }
        let snap = store.read_snapshot();
        assert!(snap.engine.rpm >= 800.0);
        assert!(snap.vehicle.fuel_level <= 75.0);
        assert!(snap.vehicle.odometer >= 12345.6);
    }

    #[test]
    fn gear_zero_iff_speed_below_epsilon() {
        let store = StateStore::new("idle");
        let mut engine = ScenarioEngine::new(Some(7), false);
        for _ in 0..5000 {
            engine.tick(&store, 0.01);
            let snap = store.read_snapshot();
            if snap.vehicle.speed < 0.1 {
                assert_eq!(snap.vehicle.gear, 0);
            } else {
                assert_ne!(snap.vehicle.gear, 0);
            }
        }
    }

    #[test]
    fn disabling_dtc_injection_keeps_list_empty() {
        let store = StateStore::new("idle");
        let mut engine = ScenarioEngine::new(Some(3), false);
        for _ in 0..200_000 {
            engine.tick(&store, 0.01);
        }
        assert_eq!(store.active_dtc_count(), 0);
    }

    #[test]
    fn parked_ignition_off_zeros_everything() {
        let store = StateStore::new("idle");
        let mut engine = ScenarioEngine::new(Some(1), false);
        engine.current = Scenario::Parking;
        engine.parked_engine_off = true;
        engine.next_reselect_tick = u64::MAX;
        engine.tick(&store, 0.01);
        let snap = store.read_snapshot();
        assert!(!snap.engine.is_running);
        assert_eq!(snap.engine.rpm, 0.0);
        assert_eq!(snap.vehicle.speed, 0.0);
        assert_eq!(snap.vehicle.gear, 0);
        assert!((12.0..13.2).contains(&snap.vehicle.battery_voltage));
    }

    #[test]
    fn parked_ignition_on_idles() {
        let store = StateStore::new("idle");
        let mut engine = ScenarioEngine::new(Some(1), false);
        engine.current = Scenario::Parking;
        engine.parked_engine_off = false;
        engine.next_reselect_tick = u64::MAX;
        engine.tick(&store, 0.01);
        let snap = store.read_snapshot();
        assert!(snap.engine.is_running);
        assert!(snap.engine.rpm >= 800.0);
    }
}
