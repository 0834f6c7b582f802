pub mod model;
pub mod parsing;

use anyhow::Context;
use clap::Parser;
use json::object;
use log::info;
use model::activation::Activation;
use model::init::InitMethod;
use model::layers::LayerSpec;
use model::loss::Loss;
use model::optim::Sgd;
use model::sequential::Sequential;
use model::{EpochRecord, FitOptions, Model};
use ndarray::{ArrayView1, ArrayView2, Axis};
use parsing::kmnist::{self, Split};
use parsing::{argmax, mnist, Dataset, NUM_CLASSES};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DatasetFormat {
    /// <prefix>-{train,test}-imgs.npz and <prefix>-{train,test}-labels.npz
    Npz,
    /// <prefix>_train.csv and <prefix>_test.csv, one "label,pixels..." row per image
    Csv,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the dataset files
    #[arg(short, long, default_value = "../../rois-codh/kmnist")]
    data_dir: PathBuf,

    /// Dataset file name prefix, e.g. kmnist for kmnist-train-imgs.npz
    #[arg(short, long, default_value = "kmnist")]
    prefix: String,

    /// Format of the dataset files
    #[arg(short, long, value_enum, default_value_t = DatasetFormat::Npz)]
    format: DatasetFormat,

    /// Learning rate of the network
    #[arg(short, long, default_value_t = 0.005)]
    learning_rate: f32,

    /// Batch size of the network
    #[arg(short, long, default_value_t = 1)]
    batch_size: usize,

    /// Number of epochs to train the network for
    #[arg(short, long, default_value_t = 1)]
    num_epochs: usize,

    /// Number of convolution filters
    #[arg(long, default_value_t = 8)]
    filters: usize,

    /// Side of the square convolution kernel
    #[arg(long, default_value_t = 3)]
    kernel_size: usize,

    /// Activation applied to the convolution output
    #[arg(long, value_enum, default_value_t = Activation::Linear)]
    conv_activation: Activation,

    /// Side of the square max pooling window
    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// Weight initialization method
    #[arg(short, long, value_enum, default_value_t = InitMethod::Xavier)]
    initialization: InitMethod,

    /// Seed for weight initialization and shuffling
    #[arg(short, long, default_value = None)]
    seed: Option<u64>,

    /// Only use the first N training and validation images
    #[arg(long, default_value = None)]
    limit: Option<usize>,

    /// Keep the training set in file order
    #[arg(long)]
    no_shuffle: bool,

    /// Hide the progress bar and per-epoch lines
    #[arg(short, long)]
    quiet: bool,

    /// Save the per-epoch metrics as CSV
    #[arg(long, default_value = None)]
    history_path: Option<PathBuf>,

    /// Whether or not to export the model's weights
    /// Weights are exported in JSON format
    #[arg(short, long, default_value = None)]
    weight_path: Option<PathBuf>,
}

fn init_logger() {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

/// Load the training and the validation set
fn load_datasets(args: &Args) -> anyhow::Result<(Dataset, Dataset)> {
    let (train, test) = match args.format {
        DatasetFormat::Npz => (
            kmnist::load_split(&args.data_dir, &args.prefix, Split::Train)
                .context("Failed to load the training set")?,
            kmnist::load_split(&args.data_dir, &args.prefix, Split::Test)
                .context("Failed to load the validation set")?,
        ),
        DatasetFormat::Csv => (
            mnist::parse_dataset(&args.data_dir.join(format!("{}_train.csv", args.prefix)))
                .context("Failed to load the training set")?,
            mnist::parse_dataset(&args.data_dir.join(format!("{}_test.csv", args.prefix)))
                .context("Failed to load the validation set")?,
        ),
    };

    Ok(match args.limit {
        Some(limit) => {
            info!("Limiting both sets to {} images", limit);
            (train.take(limit), test.take(limit))
        }
        None => (train, test),
    })
}

/// Conv2D -> MaxPooling2D -> Flatten -> Dense(softmax)
fn network(args: &Args) -> Vec<LayerSpec> {
    vec![
        LayerSpec::Conv2D {
            filters: args.filters,
            kernel_size: args.kernel_size,
            use_bias: false,
            activation: args.conv_activation,
        },
        LayerSpec::MaxPool2D {
            pool_size: args.pool_size,
        },
        LayerSpec::Flatten,
        LayerSpec::Dense {
            units: NUM_CLASSES,
            activation: Activation::Softmax,
        },
    ]
}

fn log_summary(model: &Sequential) {
    info!("Input shape {:?}", model.input_shape());

    let mut total = 0;
    for layer in model.summary() {
        info!(
            "{:<16} {:<16} {:>8}",
            layer.name,
            format!("{:?}", layer.output_shape),
            layer.params
        );
        total += layer.params;
    }

    info!("Total params: {}", total);
}

/// Number of rows whose most likely class differs from the label
fn count_mistakes(predictions: ArrayView2<f32>, labels: ArrayView1<usize>) -> usize {
    predictions
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(prediction, label)| argmax(*prediction) != **label)
        .count()
}

/// Test the model on the validation set, returning the number of mistakes
fn test_model(dataset: &Dataset, model: &Sequential) -> anyhow::Result<usize> {
    let predictions = model.predict(&dataset.images.view())?;

    Ok(count_mistakes(predictions.view(), dataset.labels().view()))
}

/// Write the per-epoch metrics to a CSV file
fn write_history(history_path: &Path, history: &[EpochRecord]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(history_path)?;

    for record in history {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

/// Write the weights of the model in JSON format
/// The keys are e.g. conv2d_0/kernel, dense_3/kernel, dense_3/bias. Each value holds the
/// shape of the weight array and its elements in row-major order
fn write_weights(weight_path: &Path, model: &Sequential) -> anyhow::Result<()> {
    let mut data = object! {};
    let mut file = File::create(weight_path)?;

    for (key, weight) in model.weights() {
        let mut entry = object! {};
        entry["shape"] = weight.shape().to_vec().into();
        entry["values"] = weight.iter().copied().collect::<Vec<f32>>().into();

        data[key] = entry;
    }

    file.write_all(data.dump().as_bytes())?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Args::parse();

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (train, test) = load_datasets(&args)?;

    let mut model = Sequential::build(
        &train.images.shape()[1..],
        &network(&args),
        args.initialization,
        &mut rng,
    )
    .context("Failed to build the network")?;
    model.compile(Sgd::new(args.learning_rate), Loss::CategoricalCrossentropy);
    log_summary(&model);

    let options = FitOptions {
        epochs: args.num_epochs,
        batch_size: args.batch_size,
        shuffle: !args.no_shuffle,
        verbose: !args.quiet,
    };

    let start = Instant::now();
    let history = model
        .fit(&train, Some(&test), &options, &mut rng)
        .context("Training failed")?;
    println!("Elapsed time: {}", start.elapsed().as_secs_f64());

    if let Some(history_path) = &args.history_path {
        write_history(history_path, &history)
            .with_context(|| format!("Failed to write {}", history_path.display()))?;
        info!("Wrote training history to {}", history_path.display());
    }

    if let Some(weight_path) = &args.weight_path {
        write_weights(weight_path, &model)
            .with_context(|| format!("Failed to write {}", weight_path.display()))?;
        info!("Wrote weights to {}", weight_path.display());
    }

    let num_mistakes = test_model(&test, &model)?;
    println!("The number of mistakes is {}", num_mistakes);

    Ok(())
}
