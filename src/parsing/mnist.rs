use super::{DataError, Dataset, IMAGE_SIDE};
use csv::ReaderBuilder;
use log::info;
use ndarray::Array3;
use std::io::Read;
use std::path::Path;

const NUM_FEATURES: usize = IMAGE_SIDE * IMAGE_SIDE;
const LINE_SIZE: usize = NUM_FEATURES + 1;

/// Parse a record of the form <label>,<pixel0x0>,<pixel0x1>,...
/// Returns the label and the pixels
fn parse_record(record: &csv::StringRecord, idx: usize) -> Result<(usize, Vec<u8>), DataError> {
    if record.len() != LINE_SIZE {
        return Err(DataError::Malformed {
            record: idx,
            reason: format!("expected {} fields, found {}", LINE_SIZE, record.len()),
        });
    }

    let mut fields = record.iter().map(|field| {
        field.trim().parse::<u8>().map_err(|err| DataError::Malformed {
            record: idx,
            reason: format!("{:?}: {}", field, err),
        })
    });

    // The iterator is non-empty since the record has LINE_SIZE fields
    let label = fields.next().unwrap_or(Ok(0))? as usize;
    let pixels = fields.collect::<Result<Vec<u8>, DataError>>()?;

    Ok((label, pixels))
}

/// Parse a dataset in the "MNIST in CSV" layout: a header row, then one image per row
/// The dataset is taken from here https://www.kaggle.com/datasets/oddrationale/mnist-in-csv
pub fn read_dataset<R: Read>(reader: R) -> Result<Dataset, DataError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let mut pixels = Vec::new();
    let mut labels = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let (label, row) = parse_record(&record?, idx)?;

        pixels.extend(row);
        labels.push(label);
    }

    let images = Array3::from_shape_vec((labels.len(), IMAGE_SIDE, IMAGE_SIDE), pixels)?;

    Dataset::from_raw(images.view(), &labels)
}

// Return the dataset stored in the CSV file at `path`
pub fn parse_dataset(path: &Path) -> Result<Dataset, DataError> {
    let file = std::fs::File::open(path).map_err(|source| DataError::Io {
        path: path.to_owned(),
        source,
    })?;
    let dataset = read_dataset(file)?;

    info!(
        "Loaded {}: images {:?}, target {:?}",
        path.display(),
        dataset.images.shape(),
        dataset.target.shape()
    );

    Ok(dataset)
}
