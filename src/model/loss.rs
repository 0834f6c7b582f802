use crate::parsing::argmax;
use ndarray::{Array2, ArrayView2, Axis, Zip};

/// Probabilities are clipped away from 0 and 1 before taking the log
const EPSILON: f32 = 1e-7;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Loss {
    #[default]
    CategoricalCrossentropy,
}

impl Loss {
    /// Mean loss over the batch
    pub fn compute(&self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> f32 {
        match self {
            Loss::CategoricalCrossentropy => {
                let total: f32 = Zip::from(predictions)
                    .and(target)
                    .fold(0f32, |acc, &p, &y| acc + y * clip(p).ln());

                -total / predictions.nrows() as f32
            }
        }
    }

    /// Gradient of the mean loss WRT the predictions
    pub fn gradient(&self, predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Loss::CategoricalCrossentropy => {
                let n = predictions.nrows() as f32;
                let mut grad = Array2::zeros(predictions.raw_dim());
                Zip::from(&mut grad)
                    .and(predictions)
                    .and(target)
                    .for_each(|g, &p, &y| *g = -y / clip(p) / n);
                grad
            }
        }
    }
}

fn clip(p: f32) -> f32 {
    p.clamp(EPSILON, 1f32 - EPSILON)
}

/// Number of rows whose most likely class is the target class
pub fn num_correct(predictions: ArrayView2<f32>, target: ArrayView2<f32>) -> usize {
    predictions
        .axis_iter(Axis(0))
        .zip(target.axis_iter(Axis(0)))
        .filter(|(prediction, target_row)| argmax(*prediction) == argmax(*target_row))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn crossentropy_of_confident_predictions() {
        let target = array![[0f32, 1.0], [1.0, 0.0]];
        let perfect = array![[0f32, 1.0], [1.0, 0.0]];
        let uniform = array![[0.5f32, 0.5], [0.5, 0.5]];

        assert!(Loss::CategoricalCrossentropy.compute(perfect.view(), target.view()) < 1e-6);
        assert_abs_diff_eq!(
            Loss::CategoricalCrossentropy.compute(uniform.view(), target.view()),
            2f32.ln(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn crossentropy_stays_finite_on_zero_probability() {
        let target = array![[1f32, 0.0]];
        let wrong = array![[0f32, 1.0]];
        let loss = Loss::CategoricalCrossentropy.compute(wrong.view(), target.view());

        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn gradient_is_averaged_over_batch() {
        let target = array![[0f32, 1.0], [1.0, 0.0]];
        let predictions = array![[0.5f32, 0.5], [0.25, 0.75]];
        let grad = Loss::CategoricalCrossentropy.gradient(predictions.view(), target.view());

        assert_abs_diff_eq!(grad, array![[0f32, -1.0], [-2.0, 0.0]], epsilon = 1e-6);
    }

    #[test]
    fn counts_correct_rows() {
        let target = array![[0f32, 1.0], [1.0, 0.0], [1.0, 0.0]];
        let predictions = array![[0.1f32, 0.9], [0.3, 0.7], [0.6, 0.4]];

        assert_eq!(num_correct(predictions.view(), target.view()), 2);
    }
}
