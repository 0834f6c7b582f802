use ndarray::{Array, Dimension, Zip};

/// Plain stochastic gradient descent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Sgd {
        Sgd { learning_rate }
    }

    /// Perform a GD step on `param`
    pub fn step<D: Dimension>(&self, param: &mut Array<f32, D>, grad: &Array<f32, D>) {
        Zip::from(param)
            .and(grad)
            .for_each(|w, &g| *w -= self.learning_rate * g);
    }
}
