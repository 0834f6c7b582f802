use super::{check_input, Layer};
use crate::model::activation::Activation;
use crate::model::init::InitMethod;
use crate::model::optim::Sgd;
use crate::model::ModelError;
use ndarray::{Array1, Array2, ArrayD, ArrayViewD, Ix2};
use rand::Rng;

/// Fully connected layer: `activation(x . W + b)`
pub struct Dense {
    pub weights: Array2<f32>, // inputs x units
    pub bias: Array1<f32>,
    pub activation: Activation,
    // Input, pre-activations and activations of the last training pass
    cache: Option<(Array2<f32>, Array2<f32>, Array2<f32>)>,
    grads: Option<(Array2<f32>, Array1<f32>)>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        input_shape: &[usize],
        units: usize,
        activation: Activation,
        init: InitMethod,
        rng: &mut R,
    ) -> Result<Dense, String> {
        let inputs = match input_shape {
            [inputs] => *inputs,
            _ => return Err(format!("expected a flat input, got {:?}", input_shape)),
        };
        if units == 0 || inputs == 0 {
            return Err("dense layer needs at least one input and one unit".to_string());
        }

        Ok(Dense {
            weights: init.weights((inputs, units), inputs, units, rng),
            bias: Array1::zeros(units),
            activation,
            cache: None,
            grads: None,
        })
    }

    fn compute(
        &self,
        input: ArrayViewD<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>), ModelError> {
        check_input(self.name(), &input, &[self.weights.nrows()])?;
        let input = input.into_dimensionality::<Ix2>()?.to_owned();

        let z = input.dot(&self.weights) + &self.bias;
        let a = self.activation.forward(&z);

        Ok((input, z, a))
    }
}

impl Layer for Dense {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.weights.ncols()]
    }

    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let (_, _, a) = self.compute(input)?;
        Ok(a.into_dyn())
    }

    fn forward_train(&mut self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let (input, z, a) = self.compute(input)?;
        let output = a.clone().into_dyn();

        self.cache = Some((input, z, a));

        Ok(output)
    }

    fn backward(&mut self, grad: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let (input, z, a) = self.cache.take().ok_or(ModelError::MissingCache(self.name()))?;
        let grad = grad.into_dimensionality::<Ix2>()?;

        let dz = self.activation.backward(&z, &a, grad);
        // Gradient WRT the weights and biases in the current layer
        let weight_grad = input.t().dot(&dz);
        let bias_grad = dz.sum_axis(ndarray::Axis(0));

        self.grads = Some((weight_grad, bias_grad));

        Ok(dz.dot(&self.weights.t()).into_dyn())
    }

    fn update(&mut self, optimizer: &Sgd) {
        if let Some((weight_grad, bias_grad)) = self.grads.take() {
            optimizer.step(&mut self.weights, &weight_grad);
            optimizer.step(&mut self.bias, &bias_grad);
        }
    }

    fn weights(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("kernel", self.weights.view().into_dyn()),
            ("bias", self.bias.view().into_dyn()),
        ]
    }
}
