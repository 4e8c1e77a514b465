//! Sinusoid regression tasks (the MAML paper's 1-D benchmark).
//!
//! Each task is `y = A·sin(x - φ)` with amplitude `A ~ U[0.1, 5.0]` and
//! phase `φ ~ U[0, π]`; inputs are drawn from `U[-5, 5]`.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{MamlError, Result};
use crate::rng::SimpleRng;
use crate::task::{Task, TaskDistribution, TaskSample};

/// Number of points returned by [`SineTask::get_all_samples`].
pub const GROUND_TRUTH_POINTS: usize = 100;

/// Ranges defining the sinusoid task family.
///
/// # Example
///
/// ```
/// use maml_core::tasks::SineConfig;
///
/// let config = SineConfig::default();
/// assert_eq!(config.input_range, (-5.0, 5.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SineConfig {
    /// Amplitude range (default: 0.1..5.0).
    pub amp_range: (f32, f32),
    /// Phase range (default: 0..π).
    pub phase_range: (f32, f32),
    /// Input range (default: -5..5).
    pub input_range: (f32, f32),
}

impl Default for SineConfig {
    fn default() -> Self {
        Self {
            amp_range: (0.1, 5.0),
            phase_range: (0.0, std::f32::consts::PI),
            input_range: (-5.0, 5.0),
        }
    }
}

/// A distribution over sinusoid tasks.
#[derive(Debug, Clone)]
pub struct SineFamily {
    config: SineConfig,
    rng: SimpleRng,
    name: String,
}

impl SineFamily {
    /// Creates a family with the given ranges and seed.
    pub fn new(config: SineConfig, seed: u64) -> Self {
        Self {
            config,
            rng: SimpleRng::new(seed),
            name: "sinusoid".to_string(),
        }
    }

    /// The input range tasks draw from.
    pub fn input_range(&self) -> (f32, f32) {
        self.config.input_range
    }
}

impl TaskDistribution for SineFamily {
    fn dataset_name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self, n: usize) -> Result<Vec<Box<dyn Task>>> {
        let (amp_lo, amp_hi) = self.config.amp_range;
        let (ph_lo, ph_hi) = self.config.phase_range;
        let mut tasks: Vec<Box<dyn Task>> = Vec::with_capacity(n);
        for _ in 0..n {
            let amp = self.rng.next_f32_range(amp_lo, amp_hi);
            let phase = self.rng.next_f32_range(ph_lo, ph_hi);
            tasks.push(Box::new(SineTask {
                amp,
                phase,
                input_range: self.config.input_range,
                rng: self.rng.fork(),
            }));
        }
        Ok(tasks)
    }
}

/// One sinusoid `y = amp·sin(x - phase)`.
#[derive(Debug, Clone)]
pub struct SineTask {
    amp: f32,
    phase: f32,
    input_range: (f32, f32),
    rng: SimpleRng,
}

impl SineTask {
    /// Creates a task directly (mostly for tests).
    pub fn new(amp: f32, phase: f32, input_range: (f32, f32), seed: u64) -> Self {
        Self {
            amp,
            phase,
            input_range,
            rng: SimpleRng::new(seed),
        }
    }

    /// Evaluates the ground-truth function.
    pub fn eval(&self, x: f32) -> f32 {
        self.amp * (x - self.phase).sin()
    }

    fn draw(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        let (lo, hi) = self.input_range;
        let xs: Vec<f32> = (0..n).map(|_| self.rng.next_f32_range(lo, hi)).collect();
        let ys = xs.iter().map(|&x| self.eval(x)).collect();
        (xs, ys)
    }
}

impl Task for SineTask {
    fn sample(&mut self, num_shots: usize, test_shots: usize) -> Result<TaskSample> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("SineTask sample: {e}"),
        };
        let device = Device::Cpu;
        let (xc, yc) = self.draw(num_shots);
        let (xt, yt) = self.draw(test_shots);
        Ok(TaskSample {
            x_c: Tensor::from_vec(xc, (num_shots, 1), &device).map_err(map_err)?,
            y_c: Tensor::from_vec(yc, num_shots, &device).map_err(map_err)?,
            x_t: Tensor::from_vec(xt, (test_shots, 1), &device).map_err(map_err)?,
            y_t: Tensor::from_vec(yt, test_shots, &device).map_err(map_err)?,
        })
    }

    fn get_all_samples(&self) -> Result<(Tensor, Tensor)> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("SineTask get_all_samples: {e}"),
        };
        let (lo, hi) = self.input_range;
        let step = (hi - lo) / (GROUND_TRUTH_POINTS - 1) as f32;
        let xs: Vec<f32> = (0..GROUND_TRUTH_POINTS)
            .map(|i| lo + step * i as f32)
            .collect();
        let ys: Vec<f32> = xs.iter().map(|&x| self.eval(x)).collect();
        let device = Device::Cpu;
        Ok((
            Tensor::from_vec(xs, (GROUND_TRUTH_POINTS, 1), &device).map_err(map_err)?,
            Tensor::from_vec(ys, GROUND_TRUTH_POINTS, &device).map_err(map_err)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_shapes() {
        let mut family = SineFamily::new(SineConfig::default(), 42);
        let mut tasks = family.sample(3).unwrap();
        assert_eq!(tasks.len(), 3);
        let s = tasks[0].sample(5, 7).unwrap();
        assert_eq!(s.x_c.dims(), &[5, 1]);
        assert_eq!(s.y_c.dims(), &[5]);
        assert_eq!(s.x_t.dims(), &[7, 1]);
        assert_eq!(s.y_t.dims(), &[7]);
        assert_eq!(s.num_shots(), 5);
        assert_eq!(s.test_shots(), 7);
    }

    #[test]
    fn labels_follow_the_sinusoid() {
        let mut task = SineTask::new(2.0, 0.5, (-5.0, 5.0), 1);
        let s = task.sample(10, 0).unwrap();
        let xs = s.x_c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let ys = s.y_c.to_vec1::<f32>().unwrap();
        for (x, y) in xs.iter().zip(ys.iter()) {
            assert!((2.0 * (x - 0.5).sin() - y).abs() < 1e-5);
            assert!((-5.0..5.0).contains(x));
        }
    }

    #[test]
    fn same_seed_same_tasks() {
        let mut a = SineFamily::new(SineConfig::default(), 7);
        let mut b = SineFamily::new(SineConfig::default(), 7);
        let sa = a.sample(1).unwrap()[0].sample(4, 4).unwrap();
        let sb = b.sample(1).unwrap()[0].sample(4, 4).unwrap();
        assert_eq!(
            sa.y_t.to_vec1::<f32>().unwrap(),
            sb.y_t.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn ground_truth_spans_input_range() {
        let task = SineTask::new(1.0, 0.0, (-5.0, 5.0), 0);
        let (xs, ys) = task.get_all_samples().unwrap();
        assert_eq!(xs.dims(), &[GROUND_TRUTH_POINTS, 1]);
        assert_eq!(ys.dims(), &[GROUND_TRUTH_POINTS]);
        let xs = xs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((xs[0] + 5.0).abs() < 1e-6);
        assert!((xs[GROUND_TRUTH_POINTS - 1] - 5.0).abs() < 1e-4);
    }
}
