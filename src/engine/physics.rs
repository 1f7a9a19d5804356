//! Physics strategy (§4.4.2): a longitudinal single-degree-of-freedom
//! vehicle model cycling through a fixed driving cycle.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::Engine;
use crate::state::{EngineState, StateStore, VehicleState};

const MASS_KG: f32 = 1500.0;
const DRAG_COEFFICIENT: f32 = 0.3;
const FRONTAL_AREA_M2: f32 = 2.2;
const MAX_POWER_W: f32 = 150_000.0;
const MAX_TORQUE_NM: f32 = 350.0;
const GRAVITY: f32 = 9.81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrivingPhase {
    City1,
    Light1,
    City2,
    Light2,
    Highway,
    Parking,
}

impl DrivingPhase {
    const CYCLE: [DrivingPhase; 6] = [
        DrivingPhase::City1,
        DrivingPhase::Light1,
        DrivingPhase::City2,
        DrivingPhase::Light2,
        DrivingPhase::Highway,
        DrivingPhase::Parking,
    ];

    fn duration_secs(self) -> f32 {
        match self {
            DrivingPhase::City1 => 180.0,
            DrivingPhase::Light1 => 30.0,
            DrivingPhase::City2 => 180.0,
            DrivingPhase::Light2 => 30.0,
            DrivingPhase::Highway => 300.0,
            DrivingPhase::Parking => 60.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            DrivingPhase::City1 => "city_1",
            DrivingPhase::Light1 => "light_1",
            DrivingPhase::City2 => "city_2",
            DrivingPhase::Light2 => "light_2",
            DrivingPhase::Highway => "highway",
            DrivingPhase::Parking => "parking",
        }
    }

    fn next(self) -> DrivingPhase {
        let idx = Self::CYCLE.iter().position(|p| *p == self).unwrap();
        Self::CYCLE[(idx + 1) % Self::CYCLE.len()]
    }

    /// Target speed (km/h) as a function of elapsed time within the phase,
    /// following the driving-cycle curves used by the source simulator.
    fn target_speed(self, phase_time: f32) -> f32 {
        let speed = match self {
            DrivingPhase::City1 | DrivingPhase::City2 => {
                let mut target = 50.0 + 10.0 * (phase_time * 0.1).sin();
                if (phase_time as i64) % 30 < 5 {
                    target = 20.0;
                }
                target
            }
            DrivingPhase::Light1 | DrivingPhase::Light2 => {
                if phase_time < 10.0 {
                    (50.0 - phase_time * 5.0).max(0.0)
                } else if phase_time < 20.0 {
                    0.0
                } else {
                    (50.0_f32).min((phase_time - 20.0) * 5.0)
                }
            }
            DrivingPhase::Highway => {
                if phase_time < 30.0 {
                    50.0 + (phase_time / 30.0) * 65.0
                } else if phase_time < 270.0 {
                    115.0 + 5.0 * (phase_time * 0.05).sin()
                } else {
                    115.0 - ((phase_time - 270.0) / 30.0) * 65.0
                }
            }
            DrivingPhase::Parking => {
                if phase_time < 10.0 {
                    (50.0 - phase_time * 5.0).max(0.0)
                } else {
                    0.0
                }
            }
        };
        speed.clamp(0.0, 255.0)
    }
}

pub struct PhysicsEngine {
    phase: DrivingPhase,
    phase_time: f32,
    target_throttle: f32,
    brake: f32,
    t: f32,
    #[allow(dead_code)]
    rng: StdRng,
}

impl PhysicsEngine {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            phase: DrivingPhase::City1,
            phase_time: 0.0,
            target_throttle: 0.0,
            brake: 0.0,
            t: 0.0,
            rng,
        }
    }

    fn advance_phase(&mut self, dt_secs: f32) {
        self.phase_time += dt_secs;
        if self.phase_time > self.phase.duration_secs() {
            let next = self.phase.next();
            info!(from = self.phase.label(), to = next.label(), "driving phase transition");
            self.phase = next;
            self.phase_time = 0.0;
        }
    }

    fn update_controller(&mut self, dt_secs: f32, engine: &mut EngineState, vehicle: &mut VehicleState) {
        let target_speed = self.phase.target_speed(self.phase_time);
        let speed_diff = target_speed - vehicle.speed;

        let mut brake = 0.0f32;
        if speed_diff > 2.0 {
            self.target_throttle = (speed_diff * 5.0).min(80.0);
        } else if speed_diff < -2.0 {
            self.target_throttle = 0.0;
            brake = (-speed_diff * 5.0).min(80.0);
        } else if vehicle.speed > 1.0 {
            self.target_throttle = 20.0 + vehicle.speed * 0.3;
        } else {
            self.target_throttle = 0.0;
        }

        let throttle_diff = self.target_throttle - engine.throttle_position;
        engine.throttle_position = (engine.throttle_position + throttle_diff * dt_secs * 3.0).clamp(0.0, 100.0);
        self.brake = brake;
    }

    fn update_dynamics(&mut self, dt_secs: f32, engine: &mut EngineState, vehicle: &mut VehicleState) {
        let mut speed_ms = vehicle.speed / 3.6;

        let engine_force = if engine.throttle_position > 0.0 {
            let rpm_normalized = engine.rpm / 6000.0;
            let power_factor = rpm_normalized * (2.0 - rpm_normalized);
            let force = (MAX_POWER_W * power_factor * engine.throttle_position / 100.0) / speed_ms.max(1.0);
            force.min(MAX_TORQUE_NM * 10.0)
        } else {
            0.0
        };

        let brake_force = self.brake * 150.0;
        let drag = 0.5 * 1.225 * DRAG_COEFFICIENT * FRONTAL_AREA_M2 * speed_ms * speed_ms;
        let rolling = 0.015 * MASS_KG * GRAVITY;

        let total_force = engine_force - brake_force - drag - rolling;
        let acceleration = total_force / MASS_KG;

        speed_ms = (speed_ms + acceleration * dt_secs).max(0.0);
        vehicle.speed = (speed_ms * 3.6).clamp(0.0, 255.0);

        if vehicle.speed > 0.0 {
            vehicle.odometer += (vehicle.speed as f64 / 3600.0) * dt_secs as f64;
        }

        self.update_rpm(dt_secs, engine, vehicle);
        self.update_gear(vehicle);
    }

    fn update_rpm(&mut self, dt_secs: f32, engine: &mut EngineState, vehicle: &VehicleState) {
        let target_rpm = if vehicle.speed < 0.1 {
            800.0 + engine.throttle_position * 20.0
        } else {
            let ratio = match vehicle.gear {
                1 => 3.5,
                2 => 2.1,
                3 => 1.4,
                4 => 1.0,
                5 => 0.8,
                6 => 0.65,
                _ => 1.0,
            };
            const WHEEL_DIAMETER_M: f32 = 0.65;
            let wheel_rpm = (vehicle.speed * 1000.0 / 60.0) / (WHEEL_DIAMETER_M * std::f32::consts::PI);
            (wheel_rpm * ratio * 4.1 + engine.throttle_position * 10.0).clamp(800.0, 6500.0)
        };

        let rpm_diff = target_rpm - engine.rpm;
        engine.rpm += rpm_diff * dt_secs * 3.0;
        engine.rpm += (self.t * 10.0).sin() * 5.0;
        engine.rpm = engine.rpm.clamp(800.0, 6500.0);
    }

    fn update_gear(&self, vehicle: &mut VehicleState) {
        let speed = vehicle.speed;
        vehicle.gear = if speed < 0.1 {
            0
        } else if speed < 20.0 {
            1
        } else if speed < 40.0 {
            2
        } else if speed < 60.0 {
            3
        } else if speed < 80.0 {
            4
        } else if speed < 100.0 {
            5
        } else {
            6
        };
    }

    fn update_temperature(&self, dt_secs: f32, engine: &mut EngineState) {
        let target_temp = if engine.rpm > 800.0 {
            85.0 + engine.throttle_position / 100.0 * 10.0
        } else {
            20.0
        };
        let temp_diff = target_temp - engine.coolant_temp;
        engine.coolant_temp = (engine.coolant_temp + temp_diff * dt_secs * 0.02).min(95.0);
        engine.oil_temp = engine.coolant_temp + 8.0;
    }
}

impl Engine for PhysicsEngine {
    fn tick(&mut self, store: &StateStore, dt_secs: f32) {
        self.t += dt_secs;
        self.advance_phase(dt_secs);
        store.apply(|engine, vehicle| {
            engine.is_running = true;
            self.update_controller(dt_secs, engine, vehicle);
            self.update_dynamics(dt_secs, engine, vehicle);
            self.update_temperature(dt_secs, engine);
            engine.runtime_since_start = engine.runtime_since_start.saturating_add(dt_secs.round() as u16);
        });
        store.set_scenario(self.phase.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_and_rpm_stay_in_domain_across_a_full_cycle() {
        let store = StateStore::new("city_1");
        let mut engine = PhysicsEngine::new(Some(11));
        // One full driving cycle is 180+30+180+30+300+60 = 780s at 100 Hz.
        for _ in 0..78_000 {
            engine.tick(&store, 0.01);
            let snap = store.read_snapshot();
            assert!(snap.vehicle.speed >= 0.0);
            assert!((800.0..=6500.0).contains(&snap.engine.rpm));
        }
    }

    #[test]
    fn phase_cycles_back_to_start() {
        let mut phase = DrivingPhase::City1;
        for _ in 0..6 {
            phase = phase.next();
        }
        assert_eq!(phase, DrivingPhase::City1);
    }

    #[test]
    fn gear_zero_only_when_stopped() {
        let store = StateStore::new("city_1");
        let mut engine = PhysicsEngine::new(Some(5));
        for _ in 0..20_000 {
            engine.tick(&store, 0.01);
            let snap = store.read_snapshot();
            if snap.vehicle.speed < 0.1 {
                assert_eq!(snap.vehicle.gear, 0);
            } else {
                assert_ne!(snap.vehicle.gear, 0);
            }
        }
    }
}
