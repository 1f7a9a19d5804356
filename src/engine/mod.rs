//! Scenario/Physics Engine (C4)
//!
//! Two interchangeable strategies advance the state store at a fixed tick
//! cadence: a weighted-random scenario model (§4.4.1) and a longitudinal
//! physics model with a phased driving cycle (§4.4.2). The supervisor
//! picks one at startup via [`Strategy`].

pub mod physics;
pub mod scenario;

use crate::state::StateStore;

/// Engine selection, exposed on the CLI as `--strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Scenario,
    Physics,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scenario" => Ok(Strategy::Scenario),
            "physics" => Ok(Strategy::Physics),
            other => Err(format!("unknown strategy '{other}' (expected scenario|physics)")),
        }
    }
}

/// Common interface both strategies implement so the supervisor's tick
/// loop (§5) doesn't need to know which one is active.
pub trait Engine: Send {
    fn tick(&mut self, store: &StateStore, dt_secs: f32);
}

fn gauss(rng: &mut impl rand::Rng, mean: f32, std_dev: f32) -> f32 {
    // Box-Muller transform; avoids pulling in a distributions crate for a
    // handful of call sites.
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen_range(0.0..1.0);
    let z0 = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
    mean + z0 * std_dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn gauss_is_centered_over_many_samples() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let samples: Vec<f32> = (0..10_000).map(|_| gauss(&mut rng, 10.0, 2.0)).collect();
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!((mean - 10.0).abs() < 0.2);
    }

    #[test]
    fn strategy_parses_from_str() {
        assert_eq!("scenario".parse::<Strategy>().unwrap(), Strategy::Scenario);
        assert_eq!("physics".parse::<Strategy>().unwrap(), Strategy::Physics);
        assert!("bogus".parse::<Strategy>().is_err());
    }
}
