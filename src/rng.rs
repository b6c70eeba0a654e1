use rand::Rng;

/// A source of entropy for architecture resolution.
///
/// Resolution consumes entropy in a fixed order, so any implementation that
/// replays the same sequence of draws reproduces the same architecture.
pub trait RandomSource {
    /// A uniform draw in `[0, 1)`.
    fn uniform(&mut self) -> f64;
    /// A uniform integer in `[0, n)`. `n` is never 0.
    fn below(&mut self, n: usize) -> usize;
    /// A uniform choice from `items`, drawn as one [`below`](Self::below) index.
    ///
    /// **Panics**
    ///
    /// If `items` is empty.
    fn choose<T: Copy>(&mut self, items: &[T]) -> T
    where
        Self: Sized,
    {
        assert!(!items.is_empty(), "choose from an empty list");
        items[self.below(items.len())]
    }
}

impl<R: RandomSource + ?Sized> RandomSource for &mut R {
    fn uniform(&mut self) -> f64 {
        (**self).uniform()
    }
    fn below(&mut self, n: usize) -> usize {
        (**self).below(n)
    }
}

/// Adapts any [`rand::Rng`] into a [`RandomSource`].
///
///```
/// # use netgen::rng::{Entropy, RandomSource};
/// use rand::{rngs::StdRng, SeedableRng};
/// let mut rng = Entropy::new(StdRng::seed_from_u64(0));
/// let x = rng.choose(&[1, 2, 3]);
/// assert!((1..=3).contains(&x));
///```
#[derive(Debug, Clone)]
pub struct Entropy<R>(R);

impl<R: Rng> Entropy<R> {
    pub fn new(rng: R) -> Self {
        Self(rng)
    }
    pub fn into_inner(self) -> R {
        self.0
    }
}

impl<R: Rng> RandomSource for Entropy<R> {
    fn uniform(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
    fn below(&mut self, n: usize) -> usize {
        self.0.gen_range(0..n)
    }
}

/// Seeded entropy for experiments: the same seed always yields the same stream.
pub fn seeded(seed: u64) -> Entropy<rand::rngs::StdRng> {
    use rand::SeedableRng;
    Entropy::new(rand::rngs::StdRng::seed_from_u64(seed))
}
