//! Diffusion noise schedulers.
//!
//! Every scheduler is written against [`TensorOps`], so the same stepping
//! code runs eagerly on host tensors and is recorded by the tracer.
//! Schedulers are selected by identifier through [`SchedulerId`] and
//! dispatched through the [`DynScheduler`] enum.

pub mod ddim;
pub mod ddpm;
pub mod euler;
pub mod lms;
pub mod pndm;
pub mod schedule;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use euler::{EulerAncestralScheduler, EulerScheduler};
pub use lms::LmsScheduler;
pub use pndm::PndmScheduler;
pub use schedule::{NoiseSchedule, PredictionType, ScheduleConfig};

use crate::error::{AotError, Result};
use crate::tensor::TensorOps;

/// Registered scheduler algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerId {
    Pndm,
    Ddim,
    Ddpm,
    EulerDiscrete,
    EulerAncestralDiscrete,
    LmsDiscrete,
}

impl SchedulerId {
    /// All registered schedulers.
    pub const ALL: [SchedulerId; 6] = [
        SchedulerId::Pndm,
        SchedulerId::Ddim,
        SchedulerId::Ddpm,
        SchedulerId::EulerDiscrete,
        SchedulerId::EulerAncestralDiscrete,
        SchedulerId::LmsDiscrete,
    ];

    /// Returns the canonical identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerId::Pndm => "PNDM",
            SchedulerId::Ddim => "DDIM",
            SchedulerId::Ddpm => "DDPM",
            SchedulerId::EulerDiscrete => "EulerDiscrete",
            SchedulerId::EulerAncestralDiscrete => "EulerAncestralDiscrete",
            SchedulerId::LmsDiscrete => "LMSDiscrete",
        }
    }

    /// Parses an identifier, ignoring case and an optional `Scheduler` suffix.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let name = lower.strip_suffix("scheduler").unwrap_or(&lower);
        match name {
            "pndm" => Some(SchedulerId::Pndm),
            "ddim" => Some(SchedulerId::Ddim),
            "ddpm" => Some(SchedulerId::Ddpm),
            "eulerdiscrete" | "euler" => Some(SchedulerId::EulerDiscrete),
            "eulerancestraldiscrete" | "euler_a" => Some(SchedulerId::EulerAncestralDiscrete),
            "lmsdiscrete" | "lms" => Some(SchedulerId::LmsDiscrete),
            _ => None,
        }
    }

    /// Parses an identifier or fails with `UNKNOWN_SCHEDULER`.
    pub fn lookup(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|id| id.as_str()).collect();
            AotError::unknown_scheduler(s, &known)
        })
    }

    /// Whether the algorithm draws fresh noise while stepping.
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            SchedulerId::Ddpm | SchedulerId::EulerAncestralDiscrete
        )
    }
}

impl std::fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability set of a noise scheduler over tensors of type `T`.
pub trait Scheduler<T> {
    /// Computes the inference timesteps and clears step history.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    /// Inference timesteps in the order they are consumed.
    fn timesteps(&self) -> &[f32];

    /// Standard deviation of the initial latent noise.
    fn init_noise_sigma(&self) -> f32;

    /// Scales the model input for the current timestep.
    fn scale_model_input<B>(&mut self, ops: &mut B, sample: &T, timestep: f32) -> Result<T>
    where
        B: TensorOps<Tensor = T>;

    /// Advances the sample by one timestep given the guided noise prediction.
    fn step<B>(&mut self, ops: &mut B, model_output: &T, timestep: f32, sample: &T) -> Result<T>
    where
        B: TensorOps<Tensor = T>;
}

/// Derives the noise seed for one step of a stochastic scheduler.
pub(crate) fn step_seed(seed: u64, step_index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(step_index as u64 + 1)
}

/// Scheduler dispatch over all registered algorithms.
#[derive(Debug, Clone)]
pub enum DynScheduler<T> {
    Pndm(PndmScheduler<T>),
    Ddim(DdimScheduler),
    Ddpm(DdpmScheduler),
    Euler(EulerScheduler),
    EulerAncestral(EulerAncestralScheduler),
    Lms(LmsScheduler<T>),
}

impl<T> DynScheduler<T> {
    /// Identifier of the wrapped algorithm.
    pub fn id(&self) -> SchedulerId {
        match self {
            DynScheduler::Pndm(_) => SchedulerId::Pndm,
            DynScheduler::Ddim(_) => SchedulerId::Ddim,
            DynScheduler::Ddpm(_) => SchedulerId::Ddpm,
            DynScheduler::Euler(_) => SchedulerId::EulerDiscrete,
            DynScheduler::EulerAncestral(_) => SchedulerId::EulerAncestralDiscrete,
            DynScheduler::Lms(_) => SchedulerId::LmsDiscrete,
        }
    }
}

impl<T: Clone> Scheduler<T> for DynScheduler<T> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        match self {
            DynScheduler::Pndm(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::Ddim(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::Ddpm(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::Euler(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::EulerAncestral(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::Lms(s) => s.set_timesteps(num_inference_steps),
        }
    }

    fn timesteps(&self) -> &[f32] {
        match self {
            DynScheduler::Pndm(s) => s.timesteps(),
            DynScheduler::Ddim(s) => s.timesteps(),
            DynScheduler::Ddpm(s) => s.timesteps(),
            DynScheduler::Euler(s) => s.timesteps(),
            DynScheduler::EulerAncestral(s) => s.timesteps(),
            DynScheduler::Lms(s) => s.timesteps(),
        }
    }

    fn init_noise_sigma(&self) -> f32 {
        match self {
            DynScheduler::Pndm(s) => s.init_noise_sigma(),
            DynScheduler::Ddim(s) => s.init_noise_sigma(),
            DynScheduler::Ddpm(s) => s.init_noise_sigma(),
            DynScheduler::Euler(s) => s.init_noise_sigma(),
            DynScheduler::EulerAncestral(s) => s.init_noise_sigma(),
            DynScheduler::Lms(s) => s.init_noise_sigma(),
        }
    }

    fn scale_model_input<B>(&mut self, ops: &mut B, sample: &T, timestep: f32) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        match self {
            DynScheduler::Pndm(s) => s.scale_model_input(ops, sample, timestep),
            DynScheduler::Ddim(s) => s.scale_model_input(ops, sample, timestep),
            DynScheduler::Ddpm(s) => s.scale_model_input(ops, sample, timestep),
            DynScheduler::Euler(s) => s.scale_model_input(ops, sample, timestep),
            DynScheduler::EulerAncestral(s) => s.scale_model_input(ops, sample, timestep),
            DynScheduler::Lms(s) => s.scale_model_input(ops, sample, timestep),
        }
    }

    fn step<B>(&mut self, ops: &mut B, model_output: &T, timestep: f32, sample: &T) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        match self {
            DynScheduler::Pndm(s) => s.step(ops, model_output, timestep, sample),
            DynScheduler::Ddim(s) => s.step(ops, model_output, timestep, sample),
            DynScheduler::Ddpm(s) => s.step(ops, model_output, timestep, sample),
            DynScheduler::Euler(s) => s.step(ops, model_output, timestep, sample),
            DynScheduler::EulerAncestral(s) => s.step(ops, model_output, timestep, sample),
            DynScheduler::Lms(s) => s.step(ops, model_output, timestep, sample),
        }
    }
}

/// Creates a scheduler by id with Stable Diffusion defaults.
///
/// `seed` drives the noise of stochastic schedulers and is ignored by the
/// deterministic ones.
pub fn create_scheduler<T>(id: SchedulerId, config: ScheduleConfig, seed: u64) -> DynScheduler<T> {
    let schedule = NoiseSchedule::new(config);
    match id {
        SchedulerId::Pndm => DynScheduler::Pndm(PndmScheduler::new(schedule)),
        SchedulerId::Ddim => DynScheduler::Ddim(DdimScheduler::new(schedule)),
        SchedulerId::Ddpm => DynScheduler::Ddpm(DdpmScheduler::new(schedule, seed)),
        SchedulerId::EulerDiscrete => DynScheduler::Euler(EulerScheduler::new(schedule)),
        SchedulerId::EulerAncestralDiscrete => {
            DynScheduler::EulerAncestral(EulerAncestralScheduler::new(schedule, seed))
        }
        SchedulerId::LmsDiscrete => DynScheduler::Lms(LmsScheduler::new(schedule)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::EagerOps;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn scheduler_id_parsing() {
        assert_eq!(SchedulerId::parse("PNDM"), Some(SchedulerId::Pndm));
        assert_eq!(SchedulerId::parse("pndm"), Some(SchedulerId::Pndm));
        assert_eq!(SchedulerId::parse("DDIMScheduler"), Some(SchedulerId::Ddim));
        assert_eq!(
            SchedulerId::parse("EulerAncestralDiscrete"),
            Some(SchedulerId::EulerAncestralDiscrete)
        );
        assert_eq!(SchedulerId::parse("LMSDiscrete"), Some(SchedulerId::LmsDiscrete));
        assert_eq!(SchedulerId::parse("DPMSolverMultistep"), None);
    }

    #[test]
    fn scheduler_id_round_trips_canonical_names() {
        for id in SchedulerId::ALL {
            assert_eq!(SchedulerId::parse(id.as_str()), Some(id));
        }
    }

    #[test]
    fn lookup_unknown_lists_registry() {
        let err = SchedulerId::lookup("Foo").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::UnknownScheduler);
        assert!(err.message.contains("EulerDiscrete"));
    }

    #[test]
    fn every_scheduler_consumes_exactly_n_timesteps() {
        for id in SchedulerId::ALL {
            for n in [1, 2, 5, 50] {
                let mut scheduler: DynScheduler<ArrayD<f32>> =
                    create_scheduler(id, ScheduleConfig::default(), 7);
                scheduler.set_timesteps(n).unwrap();
                assert_eq!(scheduler.timesteps().len(), n, "{} with {} steps", id, n);

                let mut ops = EagerOps::without_network();
                let mut x = ArrayD::from_elem(IxDyn(&[1, 4, 2, 2]), 0.5_f32);
                let eps = ArrayD::from_elem(IxDyn(&[1, 4, 2, 2]), 0.1_f32);
                for t in scheduler.timesteps().to_vec() {
                    let scaled = scheduler.scale_model_input(&mut ops, &x, t).unwrap();
                    assert_eq!(scaled.shape(), x.shape());
                    x = scheduler.step(&mut ops, &eps, t, &x).unwrap();
                    assert_eq!(x.shape(), &[1, 4, 2, 2]);
                }
                assert!(x.iter().all(|v| v.is_finite()), "{} diverged", id);
            }
        }
    }

    #[test]
    fn init_noise_sigma_by_family() {
        for id in SchedulerId::ALL {
            let mut scheduler: DynScheduler<ArrayD<f32>> =
                create_scheduler(id, ScheduleConfig::default(), 0);
            scheduler.set_timesteps(50).unwrap();
            let sigma = scheduler.init_noise_sigma();
            match id {
                SchedulerId::Pndm | SchedulerId::Ddim | SchedulerId::Ddpm => {
                    assert_eq!(sigma, 1.0)
                }
                _ => assert!(sigma > 10.0, "{} init sigma {}", id, sigma),
            }
        }
    }

    #[test]
    fn step_seeds_differ_per_step() {
        assert_ne!(step_seed(1, 0), step_seed(1, 1));
        assert_ne!(step_seed(1, 0), step_seed(2, 0));
        assert_eq!(step_seed(5, 3), step_seed(5, 3));
    }

    #[test]
    fn stochastic_flags() {
        assert!(SchedulerId::Ddpm.is_stochastic());
        assert!(SchedulerId::EulerAncestralDiscrete.is_stochastic());
        assert!(!SchedulerId::Pndm.is_stochastic());
    }
}
