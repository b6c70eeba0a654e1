use ndarray as nd;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Fills a parameter array.
///
/// Random initializers draw from `rng` in memory order, so filling the same shapes in the
/// same order from the same seed reproduces the same weights.
pub trait Initializer: Debug {
    fn fill(&self, array: &mut nd::ArrayViewMutD<f32>, rng: &mut dyn RngCore);
}

#[derive(Debug, Clone, Copy)]
pub struct Zeros;

impl Initializer for Zeros {
    fn fill(&self, array: &mut nd::ArrayViewMutD<f32>, _rng: &mut dyn RngCore) {
        array.fill(0.);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Constant(pub f32);

impl Initializer for Constant {
    fn fill(&self, array: &mut nd::ArrayViewMutD<f32>, _rng: &mut dyn RngCore) {
        array.fill(self.0);
    }
}

/// Normal samples with mean 0, redrawn until within 2 standard deviations.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedNormal {
    stddev: f32,
}

impl TruncatedNormal {
    /// **Panics**
    ///
    /// If `stddev` is not finite and positive.
    pub fn new(stddev: f32) -> Self {
        assert!(
            stddev.is_finite() && stddev > 0.,
            "truncated normal stddev must be positive, found {stddev}"
        );
        Self { stddev }
    }
    fn sample(&self, rng: &mut dyn RngCore) -> f32 {
        loop {
            let x: f32 = StandardNormal.sample(rng);
            if x.abs() <= 2. {
                return x * self.stddev;
            }
        }
    }
}

impl Initializer for TruncatedNormal {
    fn fill(&self, array: &mut nd::ArrayViewMutD<f32>, rng: &mut dyn RngCore) {
        array.iter_mut().for_each(|x| *x = self.sample(rng));
    }
}

/// A serializable description of how a parameter is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Init {
    Zeros,
    Constant { value: f32 },
    TruncatedNormal { stddev: f32 },
}

impl Init {
    pub fn initializer(&self) -> Box<dyn Initializer> {
        match *self {
            Self::Zeros => Box::new(Zeros),
            Self::Constant { value } => Box::new(Constant(value)),
            Self::TruncatedNormal { stddev } => Box::new(TruncatedNormal::new(stddev)),
        }
    }
    /// Allocates and fills an array of `shape`.
    pub fn array(&self, shape: &[usize], rng: &mut dyn RngCore) -> nd::ArrayD<f32> {
        let mut array = nd::ArrayD::zeros(nd::IxDyn(shape));
        self.initializer().fill(&mut array.view_mut(), rng);
        array
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn truncated_normal_within_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let array = Init::TruncatedNormal { stddev: 0.1 }.array(&[16, 16], &mut rng);
        assert!(array.iter().all(|x| x.abs() <= 0.2));
        let mean = array.mean().unwrap();
        assert!(mean.abs() < 0.02, "mean {mean}");
    }

    #[test]
    fn seeded_fill_repeats() {
        let init = Init::TruncatedNormal { stddev: 0.01 };
        let a = init.array(&[3, 3, 6, 48], &mut StdRng::seed_from_u64(9));
        let b = init.array(&[3, 3, 6, 48], &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn constant_and_zeros() {
        let mut rng = StdRng::seed_from_u64(0);
        let c = Init::Constant { value: 0.01 }.array(&[4], &mut rng);
        c.iter().for_each(|x| assert_relative_eq!(*x, 0.01));
        let z = Init::Zeros.array(&[2, 2], &mut rng);
        assert!(z.iter().all(|x| *x == 0.));
    }
}
