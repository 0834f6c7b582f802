use super::{check_input, Layer};
use crate::model::ModelError;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

/// Collapse every instance into a vector (row-major order)
pub struct Flatten {
    input_shape: Vec<usize>,
    batch: Option<usize>,
}

impl Flatten {
    pub fn new(input_shape: &[usize]) -> Flatten {
        Flatten {
            input_shape: input_shape.to_vec(),
            batch: None,
        }
    }

    fn units(&self) -> usize {
        self.input_shape.iter().product()
    }
}

impl Layer for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.units()]
    }

    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        check_input(self.name(), &input, &self.input_shape)?;
        let batch = input.len_of(Axis(0));

        Ok(input.to_shape(IxDyn(&[batch, self.units()]))?.into_owned())
    }

    fn forward_train(&mut self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let output = self.forward(input)?;
        self.batch = Some(output.len_of(Axis(0)));

        Ok(output)
    }

    fn backward(&mut self, grad: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let batch = self.batch.take().ok_or(ModelError::MissingCache(self.name()))?;
        let mut shape = vec![batch];
        shape.extend(&self.input_shape);

        Ok(grad.to_shape(IxDyn(&shape))?.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn flattens_in_row_major_order() {
        let flatten = Flatten::new(&[2, 3, 2]);
        let input = Array::from_shape_fn(IxDyn(&[2, 2, 3, 2]), |idx| {
            (idx[0] * 100 + idx[1] * 6 + idx[2] * 2 + idx[3]) as f32
        });

        let output = flatten.forward(input.view()).unwrap();

        assert_eq!(flatten.output_shape(), vec![12]);
        assert_eq!(output.shape(), &[2, 12]);
        assert_eq!(output[[0, 7]], 7.0);
        assert_eq!(output[[1, 11]], 111.0);
    }

    #[test]
    fn backward_restores_input_shape() {
        let mut flatten = Flatten::new(&[13, 13, 8]);
        let input = ArrayD::zeros(IxDyn(&[3, 13, 13, 8]));

        flatten.forward_train(input.view()).unwrap();
        let grad = Array::from_shape_fn(IxDyn(&[3, 13 * 13 * 8]), |idx| idx[1] as f32);
        let dx = flatten.backward(grad.view()).unwrap();

        assert_eq!(dx.shape(), &[3, 13, 13, 8]);
        assert_eq!(dx[[2, 1, 0, 3]], (13 * 8 + 3) as f32);
    }
}
