use ndarray::{Array, Dimension, ShapeBuilder};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMethod {
    Default,
    Xavier,
}

impl InitMethod {
    /// Half-width of the uniform distribution the weights are drawn from
    pub fn limit(&self, fan_in: usize, fan_out: usize) -> f32 {
        match self {
            InitMethod::Default => 0.3,
            InitMethod::Xavier => (6f32 / (fan_in + fan_out) as f32).sqrt(),
        }
    }

    /// Random weight array of the given shape
    pub fn weights<Sh, D, R>(
        &self,
        shape: Sh,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
        R: Rng + ?Sized,
    {
        let boundary = self.limit(fan_in, fan_out);
        let dist = Uniform::new_inclusive(-boundary, boundary);

        Array::from_shape_simple_fn(shape, || dist.sample(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn xavier_respects_its_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights: Array2<f32> = InitMethod::Xavier.weights((50, 10), 50, 10, &mut rng);
        let limit = InitMethod::Xavier.limit(50, 10);

        assert_eq!(weights.shape(), &[50, 10]);
        assert!(weights.iter().all(|w| w.abs() <= limit));
        assert!(weights.iter().any(|w| *w != 0.0));
    }

    #[test]
    fn default_is_fixed_width() {
        assert_eq!(InitMethod::Default.limit(784, 10), 0.3);
        assert!(InitMethod::Xavier.limit(784, 10) < 0.3);
    }
}
