use super::activation::Activation;
use super::init::InitMethod;
use super::optim::Sgd;
use super::ModelError;
use ndarray::{ArrayD, ArrayViewD};
use rand::Rng;

pub mod conv;
pub mod dense;
pub mod flatten;
pub mod pool;

pub use conv::Conv2D;
pub use dense::Dense;
pub use flatten::Flatten;
pub use pool::MaxPool2D;

/// Declarative description of a layer; the input shape is inferred when the model is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    Conv2D {
        filters: usize,
        kernel_size: usize,
        use_bias: bool,
        activation: Activation,
    },
    MaxPool2D {
        pool_size: usize,
    },
    Flatten,
    Dense {
        units: usize,
        activation: Activation,
    },
}

impl LayerSpec {
    /// Instantiate the layer for inputs of shape `input_shape` (batch axis excluded)
    pub fn build<R: Rng + ?Sized>(
        &self,
        input_shape: &[usize],
        init: InitMethod,
        rng: &mut R,
    ) -> Result<Box<dyn Layer>, String> {
        Ok(match *self {
            LayerSpec::Conv2D {
                filters,
                kernel_size,
                use_bias,
                activation,
            } => Box::new(Conv2D::new(
                input_shape,
                filters,
                kernel_size,
                use_bias,
                activation,
                init,
                rng,
            )?),
            LayerSpec::MaxPool2D { pool_size } => Box::new(MaxPool2D::new(input_shape, pool_size)?),
            LayerSpec::Flatten => Box::new(Flatten::new(input_shape)),
            LayerSpec::Dense { units, activation } => {
                Box::new(Dense::new(input_shape, units, activation, init, rng)?)
            }
        })
    }
}

/// A differentiable layer working on batches (the first axis is the batch axis)
pub trait Layer {
    fn name(&self) -> &'static str;

    /// Shape of a single output instance
    fn output_shape(&self) -> Vec<usize>;

    fn num_params(&self) -> usize {
        self.weights().iter().map(|(_, w)| w.len()).sum()
    }

    /// Inference pass, nothing is cached
    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError>;

    /// Training pass, caches whatever `backward` needs
    fn forward_train(&mut self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError>;

    /// Compute the parameter gradients from the gradient WRT the output of the last
    /// `forward_train`, and return the gradient WRT its input
    fn backward(&mut self, grad: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError>;

    /// Apply the gradients computed by the last `backward`
    fn update(&mut self, _optimizer: &Sgd) {}

    /// Named trainable parameters
    fn weights(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![]
    }
}

/// Check the per-instance shape of a batch
pub(crate) fn check_input(
    layer: &'static str,
    input: &ArrayViewD<f32>,
    expected: &[usize],
) -> Result<(), ModelError> {
    if input.ndim() == 0 || &input.shape()[1..] != expected {
        return Err(ModelError::InputShape {
            layer,
            expected: expected.to_vec(),
            found: input.shape().to_vec(),
        });
    }

    Ok(())
}
