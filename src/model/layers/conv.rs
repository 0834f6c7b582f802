use super::{check_input, Layer};
use crate::model::activation::Activation;
use crate::model::init::InitMethod;
use crate::model::optim::Sgd;
use crate::model::ModelError;
use ndarray::{s, Array1, Array2, Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix4, IxDyn};
use rand::Rng;

/// 2D convolution over NHWC batches, stride 1, no padding
pub struct Conv2D {
    pub kernel: Array4<f32>, // kernel_size x kernel_size x in_channels x filters
    pub bias: Option<Array1<f32>>,
    pub activation: Activation,
    input_shape: [usize; 3],
    cache: Option<ConvCache>,
    grads: Option<(Array4<f32>, Option<Array1<f32>>)>,
}

struct ConvCache {
    batch: usize,
    cols: Array2<f32>,
    z: Array2<f32>,
    a: Array2<f32>,
}

impl Conv2D {
    pub fn new<R: Rng + ?Sized>(
        input_shape: &[usize],
        filters: usize,
        kernel_size: usize,
        use_bias: bool,
        activation: Activation,
        init: InitMethod,
        rng: &mut R,
    ) -> Result<Conv2D, String> {
        let [height, width, channels]: [usize; 3] = input_shape.try_into().map_err(|_| {
            format!("expected height x width x channels input, got {:?}", input_shape)
        })?;

        if filters == 0 || kernel_size == 0 {
            return Err("filters and kernel size must be positive".to_string());
        }
        if kernel_size > height || kernel_size > width {
            return Err(format!(
                "kernel {}x{} does not fit in a {}x{} input",
                kernel_size, kernel_size, height, width
            ));
        }

        let receptive_field = kernel_size * kernel_size;
        let kernel = init.weights(
            (kernel_size, kernel_size, channels, filters),
            receptive_field * channels,
            receptive_field * filters,
            rng,
        );

        Ok(Conv2D {
            kernel,
            bias: use_bias.then(|| Array1::zeros(filters)),
            activation,
            input_shape: [height, width, channels],
            cache: None,
            grads: None,
        })
    }

    fn kernel_size(&self) -> usize {
        self.kernel.len_of(Axis(0))
    }

    fn filters(&self) -> usize {
        self.kernel.len_of(Axis(3))
    }

    fn out_dims(&self) -> (usize, usize) {
        let k = self.kernel_size();
        (self.input_shape[0] - k + 1, self.input_shape[1] - k + 1)
    }

    /// Kernel as a (k * k * in_channels) x filters matrix
    fn kernel_matrix(&self) -> Result<Array2<f32>, ModelError> {
        let rows = self.kernel.len() / self.filters();
        Ok(self.kernel.to_shape((rows, self.filters()))?.into_owned())
    }

    /// Rearrange every k x k x c window into one row (im2col)
    fn im2col(&self, input: ArrayView4<f32>) -> Array2<f32> {
        let k = self.kernel_size();
        let (out_h, out_w) = self.out_dims();
        let batch = input.len_of(Axis(0));
        let mut cols = Array2::zeros((batch * out_h * out_w, k * k * self.input_shape[2]));

        for b in 0..batch {
            for i in 0..out_h {
                for j in 0..out_w {
                    let window = input.slice(s![b, i..i + k, j..j + k, ..]);
                    let mut row = cols.row_mut((b * out_h + i) * out_w + j);
                    row.iter_mut().zip(window.iter()).for_each(|(d, s)| *d = *s);
                }
            }
        }

        cols
    }

    /// Scatter-add row gradients back onto their windows (col2im)
    fn col2im(&self, dcols: &Array2<f32>, batch: usize) -> Array4<f32> {
        let k = self.kernel_size();
        let (out_h, out_w) = self.out_dims();
        let [height, width, channels] = self.input_shape;
        let mut dx = Array4::zeros((batch, height, width, channels));

        for b in 0..batch {
            for i in 0..out_h {
                for j in 0..out_w {
                    let row = dcols.row((b * out_h + i) * out_w + j);
                    let mut window = dx.slice_mut(s![b, i..i + k, j..j + k, ..]);
                    window.iter_mut().zip(row.iter()).for_each(|(d, s)| *d += *s);
                }
            }
        }

        dx
    }

    /// Returns the im2col matrix, the pre-activations and the activations,
    /// one row per output pixel
    fn compute(
        &self,
        input: ArrayViewD<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>), ModelError> {
        check_input(self.name(), &input, &self.input_shape)?;
        let input = input.into_dimensionality::<Ix4>()?;

        let cols = self.im2col(input);
        let mut z = cols.dot(&self.kernel_matrix()?);
        if let Some(bias) = &self.bias {
            z += bias;
        }
        let a = self.activation.forward(&z);

        Ok((cols, z, a))
    }

    fn to_output(&self, a: &Array2<f32>, batch: usize) -> Result<ArrayD<f32>, ModelError> {
        let (out_h, out_w) = self.out_dims();
        Ok(a.to_shape(IxDyn(&[batch, out_h, out_w, self.filters()]))?.into_owned())
    }
}

impl Layer for Conv2D {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn output_shape(&self) -> Vec<usize> {
        let (out_h, out_w) = self.out_dims();
        vec![out_h, out_w, self.filters()]
    }

    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let batch = input.len_of(Axis(0));
        let (_, _, a) = self.compute(input)?;

        self.to_output(&a, batch)
    }

    fn forward_train(&mut self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let batch = input.len_of(Axis(0));
        let (cols, z, a) = self.compute(input)?;
        let output = self.to_output(&a, batch)?;

        self.cache = Some(ConvCache { batch, cols, z, a });

        Ok(output)
    }

    fn backward(&mut self, grad: ArrayViewD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let cache = self.cache.take().ok_or(ModelError::MissingCache(self.name()))?;
        let grad = grad.to_shape((cache.z.nrows(), self.filters()))?;
        let dz = self.activation.backward(&cache.z, &cache.a, grad.view());

        // Gradient WRT the kernel, reshaped back to k x k x c x filters
        let kernel_grad = cache.cols.t().dot(&dz);
        let kernel_grad = kernel_grad.to_shape(self.kernel.raw_dim())?.into_owned();
        let bias_grad = self.bias.as_ref().map(|_| dz.sum_axis(Axis(0)));

        let dcols = dz.dot(&self.kernel_matrix()?.t());
        let dx = self.col2im(&dcols, cache.batch);

        self.grads = Some((kernel_grad, bias_grad));

        Ok(dx.into_dyn())
    }

    fn update(&mut self, optimizer: &Sgd) {
        if let Some((kernel_grad, bias_grad)) = self.grads.take() {
            optimizer.step(&mut self.kernel, &kernel_grad);
            if let (Some(bias), Some(bias_grad)) = (self.bias.as_mut(), bias_grad) {
                optimizer.step(bias, &bias_grad);
            }
        }
    }

    fn weights(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        let mut weights = vec![("kernel", self.kernel.view().into_dyn())];
        if let Some(bias) = &self.bias {
            weights.push(("bias", bias.view().into_dyn()));
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layers::testing::numeric_gradient;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(input_shape: &[usize], filters: usize, use_bias: bool) -> Conv2D {
        let mut rng = StdRng::seed_from_u64(3);
        Conv2D::new(
            input_shape,
            filters,
            3,
            use_bias,
            Activation::Linear,
            InitMethod::Xavier,
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn output_shape_is_valid_convolution() {
        let conv = layer(&[28, 28, 1], 8, false);
        let input = ArrayD::zeros(IxDyn(&[2, 28, 28, 1]));

        assert_eq!(conv.output_shape(), vec![26, 26, 8]);
        assert_eq!(conv.forward(input.view()).unwrap().shape(), &[2, 26, 26, 8]);
        assert_eq!(conv.num_params(), 3 * 3 * 8);
    }

    #[test]
    fn forward_matches_direct_convolution() {
        let conv = layer(&[5, 4, 2], 3, true);
        let input =
            Array::from_shape_fn((1, 5, 4, 2), |(_, i, j, c)| (i * 7 + j * 3 + c) as f32 / 10.0);
        let output = conv.forward(input.view().into_dyn()).unwrap();

        let mut expected = Array3::<f32>::zeros((3, 2, 3));
        for ((i, j, f), value) in expected.indexed_iter_mut() {
            for di in 0..3 {
                for dj in 0..3 {
                    for c in 0..2 {
                        *value += input[[0, i + di, j + dj, c]] * conv.kernel[[di, dj, c, f]];
                    }
                }
            }
        }

        assert_abs_diff_eq!(
            output.index_axis(Axis(0), 0).into_dimensionality::<ndarray::Ix3>().unwrap(),
            expected.view(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut conv = layer(&[5, 5, 2], 2, true);
        let input = Array::from_shape_fn(IxDyn(&[2, 5, 5, 2]), |idx| {
            ((idx[0] * 31 + idx[1] * 7 + idx[2] * 3 + idx[3]) % 11) as f32 / 11.0 - 0.5
        });
        // Weighted sum of the outputs as a scalar objective
        let upstream = Array::from_shape_fn(IxDyn(&[2, 3, 3, 2]), |idx| {
            (idx[1] + 2 * idx[2] + idx[3]) as f32 / 5.0 - 0.6
        });

        conv.forward_train(input.view()).unwrap();
        let dx = conv.backward(upstream.view()).unwrap();
        let (kernel_grad, bias_grad) = conv.grads.clone().unwrap();

        let numeric_dx = numeric_gradient(&input, |x| (conv.forward(x).unwrap() * &upstream).sum());
        assert_abs_diff_eq!(dx, numeric_dx, epsilon = 1e-2);

        let kernel = conv.kernel.clone().into_dyn();
        let numeric_kernel = numeric_gradient(&kernel, |k| {
            let mut probe = layer(&[5, 5, 2], 2, true);
            probe.kernel = k.into_dimensionality::<Ix4>().unwrap().to_owned();
            (probe.forward(input.view()).unwrap() * &upstream).sum()
        });
        assert_abs_diff_eq!(kernel_grad.into_dyn(), numeric_kernel, epsilon = 1e-2);

        let expected_bias = upstream.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0));
        assert_abs_diff_eq!(bias_grad.unwrap().into_dyn(), expected_bias, epsilon = 1e-4);
    }

    #[test]
    fn update_applies_sgd_step() {
        let mut conv = layer(&[4, 4, 1], 1, false);
        let before = conv.kernel.clone();
        let input = ArrayD::from_elem(IxDyn(&[1, 4, 4, 1]), 1f32);

        conv.forward_train(input.view()).unwrap();
        conv.backward(ArrayD::from_elem(IxDyn(&[1, 2, 2, 1]), 1f32).view()).unwrap();
        conv.update(&Sgd::new(0.1));

        // Every kernel tap saw four windows of ones
        assert_abs_diff_eq!(conv.kernel, before - 0.4, epsilon = 1e-6);
    }

    #[test]
    fn rejects_wrong_input_shape() {
        let conv = layer(&[28, 28, 1], 8, false);
        let input = ArrayD::zeros(IxDyn(&[1, 27, 28, 1]));

        assert!(matches!(conv.forward(input.view()), Err(ModelError::InputShape { .. })));
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut conv = layer(&[4, 4, 1], 1, false);
        let grad = ArrayD::zeros(IxDyn(&[1, 2, 2, 1]));

        assert!(matches!(conv.backward(grad.view()), Err(ModelError::MissingCache("conv2d"))));
    }
}
