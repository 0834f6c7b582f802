use ndarray::{Array2, ArrayView4};
use rand::rngs::StdRng;
use serde::Serialize;

use crate::parsing::Dataset;

pub mod activation;
pub mod init;
pub mod layers;
pub mod loss;
pub mod optim;
pub mod sequential;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("The model must be compiled before it is trained")]
    NotCompiled,

    #[error("Invalid layer #{index}: {reason}")]
    InvalidLayer { index: usize, reason: String },

    #[error("Layer {layer} expects instances of shape {expected:?}, got a batch of {found:?}")]
    InputShape {
        layer: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Layer {0} was asked for gradients before a training pass")]
    MissingCache(&'static str),

    #[error("Cannot train on an empty dataset")]
    EmptyDataset,

    #[error("Loss diverged at epoch {epoch}, step {step}")]
    Diverged { epoch: usize, step: usize },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Training hyperparams that are not part of the network itself
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub verbose: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            epochs: 1,
            batch_size: 1,
            shuffle: true,
            verbose: true,
        }
    }
}

/// Metrics of a single epoch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub seconds: f64,
}

pub type History = Vec<EpochRecord>;

pub trait Model {
    fn fit(
        &mut self,
        dataset: &Dataset,
        validation: Option<&Dataset>,
        options: &FitOptions,
        rng: &mut StdRng,
    ) -> Result<History, ModelError>;
    fn predict(&self, images: &ArrayView4<f32>) -> Result<Array2<f32>, ModelError>;
}
