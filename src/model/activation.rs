use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Linear,
    #[value(name = "relu")]
    ReLU,
    Sigmoid,
    Tanh,
    #[value(name = "leaky-relu")]
    LeakyReLU,
    Softmax,
}

impl Activation {
    /// Apply the activation to a batch of pre-activations (one instance per row)
    pub fn forward(&self, z: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Softmax => {
                let mut out = Array2::zeros(z.raw_dim());
                for (row, mut out_row) in z.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
                    out_row.assign(&softmax(row));
                }
                out
            }
            _ => z.mapv(|x| activation(self, x)),
        }
    }

    /// Gradient WRT the pre-activations, given the pre-activations `z`,
    /// the outputs `a` and the gradient WRT the outputs
    pub fn backward(&self, z: &Array2<f32>, a: &Array2<f32>, grad: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Activation::Softmax => {
                // Jacobian-vector product of softmax: p * (g - <g, p>)
                let mut out = Array2::zeros(a.raw_dim());
                Zip::from(out.rows_mut())
                    .and(a.rows())
                    .and(grad.rows())
                    .for_each(|mut out_row, p, g| {
                        let dot = g.dot(&p);
                        out_row.assign(&(&p * &g.mapv(|x| x - dot)));
                    });
                out
            }
            _ => {
                let mut out = grad.to_owned();
                Zip::from(&mut out)
                    .and(z)
                    .for_each(|g, &x| *g *= delta_activation(self, x));
                out
            }
        }
    }
}

fn activation(name: &Activation, z: f32) -> f32 {
    match name {
        Activation::ReLU => z.max(0f32),
        Activation::Sigmoid => (1f32 + (-z).exp()).recip(),
        Activation::Tanh => z.tanh(),
        Activation::Linear => z,
        Activation::LeakyReLU => z.max(0.01 * z),
        Activation::Softmax => unreachable!("softmax is applied row-wise"),
    }
}

fn delta_activation(name: &Activation, z: f32) -> f32 {
    match name {
        Activation::ReLU => if z > 0f32 {1f32} else {0f32},
        Activation::Sigmoid => activation(name, z) * (1f32 - activation(name, z)),
        Activation::Tanh => 1f32 - activation(name, z) * activation(name, z),
        Activation::Linear => 1f32,
        Activation::LeakyReLU => if z > 0f32 {1f32} else {0.01f32},
        Activation::Softmax => unreachable!("softmax is differentiated row-wise"),
    }
}

/// Softmax function - Convert scores into a probability distribution
pub fn softmax(scores: ArrayView1<f32>) -> Array1<f32> {
    let max = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    // We use a numerical trick where we shift the elements by the max, because otherwise
    // We would have to compute the exp of very large values which wraps to NaN
    let shift_scores = scores.mapv(|x| (x - max).exp());
    let sum = shift_scores.sum();

    shift_scores / sum
}
