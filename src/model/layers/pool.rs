use super::{check_input, Layer};
use crate::model::ModelError;
use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix4};

/// Max pooling over non-overlapping p x p windows
/// Trailing rows and columns that do not fill a window are dropped
pub struct MaxPool2D {
    pool_size: usize,
    input_shape: [usize; 3],
    // For every output element, the flat index of the input element it was taken from
    argmax: Option<(usize, Vec<usize>)>,
}

impl MaxPool2D {
    pub fn new(input_shape: &[usize], pool_size: usize) -> Result<MaxPool2D, String> {
        let input_shape: [usize; 3] = input_shape.try_into().map_err(|_| {
            format!("expected height x width x channels input, got {:?}", input_shape)
        })?;

        if pool_size == 0 || pool_size > input_shape[0] || pool_size > input_shape[1] {
            return Err(format!(
                "pool size {} does not fit in a {}x{} input",
                pool_size, input_shape[0], input_shape[1]
            ));
        }

        Ok(MaxPool2D {
            pool_size,
            input_shape,
            argmax: None,
        })
    }

    /// Pooled output and the flat input index of every maximum
    fn pool(&self, input: ArrayView4<f32>) -> (Array4<f32>, Vec<usize>) {
        let p = self.pool_size;
        let [height, width, channels] = self.input_shape;
        let (out_h, out_w) = (height / p, width / p);
        let batch = input.len_of(Axis(0));

        let mut output = Array4::zeros((batch, out_h, out_w, channels));
        let mut argmax = Vec::with_capacity(output.len());

        for b in 0..batch {
            for i in 0..out_h {
                for j in 0..out_w {
                    for c in 0..channels {
                        let mut best = (f32::NEG_INFINITY, 0);
                        for di in 0..p {
                            for dj in 0..p {
                                let (y, x) = (i * p + di, j * p + dj);
                                let value = input[[b, y, x, c]];
                                if value > best.0 {
                                    best = (value, ((b * height + y) * width + x) * channels + c);
                                }
                            }
                        }
                        output[[b, i, j, c]] = best.0;
                        argmax.push(best.1);
                    }
                }
            }
        }

        (output, argmax)
    }
}

impl Layer for MaxPool2D {
    fn name(&self) -> &'static str {
        "max_pooling2d"
    }

    fn output_shape(&self) -> Vec<usize> {
        let [height, width, channels] = self.input_shape;
        vec![height / self.pool_size, width / self.pool_size, channels]
    }

    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        check_input(self.name(), &input, &self.input_shape)?;
        let (output, _) = self.pool(input.into_dimensionality::<Ix4>()?);

        Ok(output.into_dyn())
    }

    fn forward_train(&mut self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        check_input(self.name(), &input, &self.input_shape)?;
        let batch = input.len_of(Axis(0));
        let (output, argmax) = self.pool(input.into_dimensionality::<Ix4>()?);

        self.argmax = Some((batch, argmax));

        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let (batch, argmax) = self.argmax.take().ok_or(ModelError::MissingCache(self.name()))?;
        let [height, width, channels] = self.input_shape;
        let mut dx = vec![0f32; batch * height * width * channels];

        // The gradient only flows through the element that was selected
        for (&idx, g) in argmax.iter().zip(grad.iter()) {
            dx[idx] += g;
        }

        Ok(Array4::from_shape_vec((batch, height, width, channels), dx)?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layers::testing::numeric_gradient;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};

    #[test]
    fn picks_window_maximum() {
        let pool = MaxPool2D::new(&[4, 4, 1], 2).unwrap();
        let input = array![[
            [1f32, 2., 5., 0.],
            [3., 4., 1., 1.],
            [0., 0., -1., -2.],
            [9., 0., -3., -4.]
        ]]
        .insert_axis(Axis(3));

        let output = pool.forward(input.view().into_dyn()).unwrap();

        assert_eq!(output.shape(), &[1, 2, 2, 1]);
        assert_eq!(
            output.into_shape((2, 2)).unwrap(),
            array![[4f32, 5.], [9., -1.]]
        );
    }

    #[test]
    fn odd_sizes_are_floored() {
        let pool = MaxPool2D::new(&[26, 26, 8], 2).unwrap();
        assert_eq!(pool.output_shape(), vec![13, 13, 8]);

        let pool = MaxPool2D::new(&[5, 7, 2], 2).unwrap();
        let input = ArrayD::zeros(IxDyn(&[3, 5, 7, 2]));
        assert_eq!(pool.forward(input.view()).unwrap().shape(), &[3, 2, 3, 2]);
    }

    #[test]
    fn gradient_routes_to_maximum() {
        let mut pool = MaxPool2D::new(&[4, 5, 2], 2).unwrap();
        // Distinct values at least 1/41 apart so every window keeps a unique maximum
        // under the finite difference step
        let input = Array::from_shape_fn(IxDyn(&[2, 4, 5, 2]), |idx| {
            ((idx[0] * 37 + idx[1] * 13 + idx[2] * 7 + idx[3] * 3) % 41) as f32 / 41.0
        });
        let upstream = Array::from_shape_fn(IxDyn(&[2, 2, 2, 2]), |idx| {
            (idx[1] * 2 + idx[2] + idx[3]) as f32 - 1.5
        });

        pool.forward_train(input.view()).unwrap();
        let dx = pool.backward(upstream.view()).unwrap();
        let numeric =
            numeric_gradient(&input, |x| (pool.forward(x).unwrap() * &upstream).sum());

        assert_abs_diff_eq!(dx, numeric, epsilon = 1e-2);
        assert_abs_diff_eq!(dx.sum(), upstream.sum(), epsilon = 1e-4);
    }

    #[test]
    fn has_no_parameters() {
        let pool = MaxPool2D::new(&[26, 26, 8], 2).unwrap();
        assert_eq!(pool.num_params(), 0);
    }
}
