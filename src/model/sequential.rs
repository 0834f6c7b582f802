use super::init::InitMethod;
use super::layers::{Layer, LayerSpec};
use super::loss::{num_correct, Loss};
use super::optim::Sgd;
use super::{EpochRecord, FitOptions, History, Model, ModelError};
use crate::parsing::Dataset;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{concatenate, Array2, ArrayD, ArrayView2, ArrayView4, ArrayViewD, Axis, Ix2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;

/// Batch size used for validation and prediction, which do not update the weights
const EVAL_BATCH_SIZE: usize = 256;

/// A stack of layers, each one feeding the next
pub struct Sequential {
    input_shape: Vec<usize>,
    layers: Vec<Box<dyn Layer>>,
    compiled: Option<(Sgd, Loss)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub output_shape: Vec<usize>,
    pub params: usize,
}

impl Sequential {
    /// Instantiate the layers described by `specs`, inferring every input shape from `input_shape`
    pub fn build<R: Rng + ?Sized>(
        input_shape: &[usize],
        specs: &[LayerSpec],
        init: InitMethod,
        rng: &mut R,
    ) -> Result<Sequential, ModelError> {
        let mut shape = input_shape.to_vec();
        let mut layers = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            let layer = spec
                .build(&shape, init, rng)
                .map_err(|reason| ModelError::InvalidLayer { index, reason })?;
            shape = layer.output_shape();
            debug!("{} #{} outputs {:?}", layer.name(), index, shape);

            layers.push(layer);
        }

        // Predictions are one row of class scores per instance
        if shape.len() != 1 || layers.is_empty() {
            return Err(ModelError::InvalidLayer {
                index: specs.len().saturating_sub(1),
                reason: format!("the model must end with a flat output, got {:?}", shape),
            });
        }

        Ok(Sequential {
            input_shape: input_shape.to_vec(),
            layers,
            compiled: None,
        })
    }

    /// Choose the optimizer and the loss used by `fit`
    pub fn compile(&mut self, optimizer: Sgd, loss: Loss) {
        self.compiled = Some((optimizer, loss));
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.output_shape()[0])
    }

    pub fn summary(&self) -> Vec<LayerSummary> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, layer)| LayerSummary {
                name: format!("{}_{}", layer.name(), i),
                output_shape: layer.output_shape(),
                params: layer.num_params(),
            })
            .collect()
    }

    /// Trainable parameters keyed as e.g. `conv2d_0/kernel`, `dense_3/bias`
    pub fn weights(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .weights()
                    .into_iter()
                    .map(move |(name, w)| (format!("{}_{}/{}", layer.name(), i, name), w))
            })
            .collect()
    }

    fn forward(&self, input: ArrayD<f32>) -> Result<Array2<f32>, ModelError> {
        let mut output = input;
        for layer in &self.layers {
            output = layer.forward(output.view())?;
        }

        Ok(output.into_dimensionality::<Ix2>()?)
    }

    /// Forward pass, backprop and GD step on one batch
    /// Returns the mean loss of the batch and the number of correct predictions
    fn train_step(
        &mut self,
        input: ArrayD<f32>,
        target: ArrayView2<f32>,
        optimizer: &Sgd,
        loss: Loss,
    ) -> Result<(f32, usize), ModelError> {
        let mut output = input;
        for layer in self.layers.iter_mut() {
            output = layer.forward_train(output.view())?;
        }
        let predictions = output.into_dimensionality::<Ix2>()?;

        let batch_loss = loss.compute(predictions.view(), target);
        let correct = num_correct(predictions.view(), target);

        // The gradient is initialized to the gradient of the loss WRT the output layer
        let mut grad = loss.gradient(predictions.view(), target).into_dyn();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(grad.view())?;
            layer.update(optimizer);
        }

        Ok((batch_loss, correct))
    }

    /// Mean loss and accuracy over a dataset
    pub fn evaluate(&self, dataset: &Dataset, batch_size: usize) -> Result<(f32, f32), ModelError> {
        let (_, loss) = self.compiled.ok_or(ModelError::NotCompiled)?;
        if dataset.is_empty() {
            return Err(ModelError::EmptyDataset);
        }

        let mut total_loss = 0f64;
        let mut correct = 0;

        for (images, target) in dataset
            .images
            .axis_chunks_iter(Axis(0), batch_size.max(1))
            .zip(dataset.target.axis_chunks_iter(Axis(0), batch_size.max(1)))
        {
            let predictions = self.forward(images.to_owned().into_dyn())?;

            total_loss += loss.compute(predictions.view(), target) as f64 * target.nrows() as f64;
            correct += num_correct(predictions.view(), target);
        }

        let n = dataset.len() as f64;
        Ok(((total_loss / n) as f32, (correct as f64 / n) as f32))
    }

    fn progress_bar(&self, steps: usize, epoch: usize, options: &FitOptions) -> ProgressBar {
        if !options.verbose {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::with_template(
            "{prefix} {pos}/{len} [{bar:30}] {elapsed_precise} - {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        let bar = ProgressBar::new(steps as u64).with_style(style);
        bar.set_prefix(format!("Epoch {}/{}", epoch + 1, options.epochs));

        bar
    }
}

impl Model for Sequential {
    /// Fit the model to the dataset
    /// Returns the metrics of every epoch
    fn fit(
        &mut self,
        dataset: &Dataset,
        validation: Option<&Dataset>,
        options: &FitOptions,
        rng: &mut StdRng,
    ) -> Result<History, ModelError> {
        let (optimizer, loss) = self.compiled.ok_or(ModelError::NotCompiled)?;
        if dataset.is_empty() {
            return Err(ModelError::EmptyDataset);
        }

        let batch_size = options.batch_size.max(1);
        let steps = (dataset.len() + batch_size - 1) / batch_size;
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut history = History::new();

        for epoch in 0..options.epochs {
            let start = Instant::now();
            if options.shuffle {
                order.shuffle(rng);
            }

            let progress = self.progress_bar(steps, epoch, options);
            let mut total_loss = 0f64;
            let mut correct = 0;
            let mut seen = 0;

            // Get a batch of instances and their targets
            for (step, indices) in order.chunks(batch_size).enumerate() {
                let images = dataset.images.select(Axis(0), indices).into_dyn();
                let target = dataset.target.select(Axis(0), indices);

                let (batch_loss, batch_correct) =
                    self.train_step(images, target.view(), &optimizer, loss)?;
                if !batch_loss.is_finite() {
                    progress.abandon();
                    return Err(ModelError::Diverged {
                        epoch: epoch + 1,
                        step: step + 1,
                    });
                }

                total_loss += batch_loss as f64 * indices.len() as f64;
                correct += batch_correct;
                seen += indices.len();

                // indicatif rate-limits the redraws
                progress.set_message(format!(
                    "loss: {:.4} - acc: {:.4}",
                    total_loss / seen as f64,
                    correct as f64 / seen as f64
                ));
                progress.inc(1);
            }
            progress.finish();

            let (val_loss, val_accuracy) = match validation {
                Some(validation) => {
                    let (val_loss, val_accuracy) = self.evaluate(validation, EVAL_BATCH_SIZE)?;
                    (Some(val_loss), Some(val_accuracy))
                }
                None => (None, None),
            };

            let record = EpochRecord {
                epoch: epoch + 1,
                loss: (total_loss / seen as f64) as f32,
                accuracy: (correct as f64 / seen as f64) as f32,
                val_loss,
                val_accuracy,
                seconds: start.elapsed().as_secs_f64(),
            };

            let line = describe_epoch(&record, options.epochs);
            if options.verbose {
                println!("{}", line);
            } else {
                info!("{}", line);
            }

            history.push(record);
        }

        Ok(history)
    }

    /// Predict the probabities for a set of images
    fn predict(&self, images: &ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let batches = images
            .axis_chunks_iter(Axis(0), EVAL_BATCH_SIZE)
            .map(|batch| self.forward(batch.to_owned().into_dyn()))
            .collect::<Result<Vec<_>, _>>()?;

        if batches.is_empty() {
            return Ok(Array2::zeros((0, self.num_classes())));
        }

        let views: Vec<ArrayView2<f32>> = batches.iter().map(|b| b.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

/// One line per epoch, e.g. `Epoch 1/1 - 46.2s - loss: 0.2433 - acc: 0.9276 - val_loss: ...`
fn describe_epoch(record: &EpochRecord, epochs: usize) -> String {
    let mut line = format!(
        "Epoch {}/{} - {:.1}s - loss: {:.4} - acc: {:.4}",
        record.epoch, epochs, record.seconds, record.loss, record.accuracy
    );
    if let (Some(val_loss), Some(val_accuracy)) = (record.val_loss, record.val_accuracy) {
        line.push_str(&format!(" - val_loss: {:.4} - val_acc: {:.4}", val_loss, val_accuracy));
    }

    line
}
