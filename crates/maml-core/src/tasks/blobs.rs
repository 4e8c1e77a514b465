//! Gaussian-blob N-way classification tasks.
//!
//! Each task places `num_classes` centres at random in `dim` dimensions;
//! an example of class `c` is its centre plus isotropic noise. Example `i`
//! of a draw belongs to class `i % num_classes`, so every class appears
//! once before any repeats. Labels are one-hot.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{MamlError, Result};
use crate::rng::SimpleRng;
use crate::task::{Task, TaskDistribution, TaskSample};

/// Parameters of the blob task family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Classes per task (the N in N-way).
    pub num_classes: usize,
    /// Input dimensionality.
    pub dim: usize,
    /// Standard deviation of the class centres.
    pub spread: f32,
    /// Standard deviation of the per-example noise.
    pub noise: f32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            num_classes: 5,
            dim: 8,
            spread: 2.0,
            noise: 0.5,
        }
    }
}

/// A distribution over blob classification tasks.
#[derive(Debug, Clone)]
pub struct BlobFamily {
    config: BlobConfig,
    rng: SimpleRng,
    name: String,
}

impl BlobFamily {
    /// Creates a family with the given parameters and seed.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] if `num_classes` or `dim` is 0.
    pub fn new(config: BlobConfig, seed: u64) -> Result<Self> {
        if config.num_classes == 0 || config.dim == 0 {
            return Err(MamlError::InvalidConfig {
                message: format!(
                    "blob family needs num_classes > 0 and dim > 0, got {} and {}",
                    config.num_classes, config.dim
                ),
            });
        }
        Ok(Self {
            config,
            rng: SimpleRng::new(seed),
            name: "blobs".to_string(),
        })
    }

    /// The family's configuration.
    pub fn config(&self) -> &BlobConfig {
        &self.config
    }
}

impl TaskDistribution for BlobFamily {
    fn dataset_name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self, n: usize) -> Result<Vec<Box<dyn Task>>> {
        let mut tasks: Vec<Box<dyn Task>> = Vec::with_capacity(n);
        for _ in 0..n {
            let centres = (0..self.config.num_classes * self.config.dim)
                .map(|_| self.rng.next_gaussian() * self.config.spread)
                .collect();
            tasks.push(Box::new(BlobTask {
                centres,
                num_classes: self.config.num_classes,
                dim: self.config.dim,
                noise: self.config.noise,
                rng: self.rng.fork(),
            }));
        }
        Ok(tasks)
    }
}

/// One blob task: fixed class centres plus a private noise stream.
#[derive(Debug, Clone)]
pub struct BlobTask {
    centres: Vec<f32>,
    num_classes: usize,
    dim: usize,
    noise: f32,
    rng: SimpleRng,
}

impl BlobTask {
    fn draw(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        let mut xs = Vec::with_capacity(n * self.dim);
        let mut ys = vec![0.0f32; n * self.num_classes];
        for i in 0..n {
            let class = i % self.num_classes;
            let centre = &self.centres[class * self.dim..(class + 1) * self.dim];
            for &c in centre {
                xs.push(c + self.rng.next_gaussian() * self.noise);
            }
            ys[i * self.num_classes + class] = 1.0;
        }
        (xs, ys)
    }
}

impl Task for BlobTask {
    fn sample(&mut self, num_shots: usize, test_shots: usize) -> Result<TaskSample> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("BlobTask sample: {e}"),
        };
        let device = Device::Cpu;
        let (xc, yc) = self.draw(num_shots);
        let (xt, yt) = self.draw(test_shots);
        Ok(TaskSample {
            x_c: Tensor::from_vec(xc, (num_shots, self.dim), &device).map_err(map_err)?,
            y_c: Tensor::from_vec(yc, (num_shots, self.num_classes), &device).map_err(map_err)?,
            x_t: Tensor::from_vec(xt, (test_shots, self.dim), &device).map_err(map_err)?,
            y_t: Tensor::from_vec(yt, (test_shots, self.num_classes), &device).map_err(map_err)?,
        })
    }

    /// The class centres, one per class, with their one-hot labels.
    fn get_all_samples(&self) -> Result<(Tensor, Tensor)> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("BlobTask get_all_samples: {e}"),
        };
        let device = Device::Cpu;
        let n = self.num_classes;
        let mut labels = vec![0.0f32; n * n];
        for c in 0..n {
            labels[c * n + c] = 1.0;
        }
        Ok((
            Tensor::from_vec(self.centres.clone(), (n, self.dim), &device).map_err(map_err)?,
            Tensor::from_vec(labels, (n, n), &device).map_err(map_err)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_one_hot_round_robin() {
        let mut family = BlobFamily::new(BlobConfig::default(), 1).unwrap();
        let mut task = family.sample(1).unwrap().remove(0);
        let s = task.sample(7, 3).unwrap();
        assert_eq!(s.x_c.dims(), &[7, 8]);
        assert_eq!(s.y_c.dims(), &[7, 5]);
        let rows = s.y_c.to_vec2::<f32>().unwrap();
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.iter().sum::<f32>(), 1.0);
            assert_eq!(row[i % 5], 1.0);
        }
    }

    #[test]
    fn zero_classes_rejected() {
        let config = BlobConfig {
            num_classes: 0,
            ..BlobConfig::default()
        };
        assert!(BlobFamily::new(config, 0).is_err());
    }

    #[test]
    fn ground_truth_is_the_centres() {
        let mut family = BlobFamily::new(BlobConfig::default(), 2).unwrap();
        let task = family.sample(1).unwrap().remove(0);
        let (xs, ys) = task.get_all_samples().unwrap();
        assert_eq!(xs.dims(), &[5, 8]);
        assert_eq!(ys.dims(), &[5, 5]);
    }
}
