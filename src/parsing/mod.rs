use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView3, Axis};
use std::path::PathBuf;

pub mod kmnist;
pub mod mnist;

pub const IMAGE_SIDE: usize = 28;
pub const NUM_CLASSES: usize = 10;
const GREYSCALE_SIZE: f32 = 255f32;

#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Archive error in {}: {source}", path.display())]
    Npz {
        path: PathBuf,
        source: ndarray_npy::ReadNpzError,
    },

    #[error("{} does not contain any array", path.display())]
    EmptyArchive { path: PathBuf },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed record {record}: {reason}")]
    Malformed { record: usize, reason: String },

    #[error("Label {label} is outside 0..{num_classes}")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("{images} images but {labels} labels")]
    ShapeMismatch { images: usize, labels: usize },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// A set of images (`count x 28 x 28 x 1`) with their one-hot targets (`count x 10`)
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array4<f32>,
    pub target: Array2<f32>,
}

impl Dataset {
    pub fn new(images: Array4<f32>, target: Array2<f32>) -> Result<Dataset, DataError> {
        if images.len_of(Axis(0)) != target.nrows() {
            return Err(DataError::ShapeMismatch {
                images: images.len_of(Axis(0)),
                labels: target.nrows(),
            });
        }

        Ok(Dataset { images, target })
    }

    /// Build a dataset from raw intensities and class indices
    pub fn from_raw(images: ArrayView3<u8>, labels: &[usize]) -> Result<Dataset, DataError> {
        Dataset::new(
            expand_channels(normalize(images)),
            one_hot(labels, NUM_CLASSES)?,
        )
    }

    pub fn len(&self) -> usize {
        self.target.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only the first `n` samples
    pub fn take(self, n: usize) -> Dataset {
        let n = n.min(self.len());

        Dataset {
            images: self.images.slice(s![..n, .., .., ..]).to_owned(),
            target: self.target.slice(s![..n, ..]).to_owned(),
        }
    }

    /// Class index of every sample
    pub fn labels(&self) -> Array1<usize> {
        self.target.map_axis(Axis(1), argmax)
    }
}

/// Map intensities in [0, 255] to [-0.5, 0.5]
pub fn normalize(images: ArrayView3<u8>) -> Array3<f32> {
    images.map(|x| *x as f32 / GREYSCALE_SIZE - 0.5)
}

/// Add the trailing channel axis: `count x h x w` becomes `count x h x w x 1`
pub fn expand_channels(images: Array3<f32>) -> Array4<f32> {
    images.insert_axis(Axis(3))
}

/// One-hot encode class indices into a `count x num_classes` matrix
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>, DataError> {
    let mut target = Array2::zeros((labels.len(), num_classes));

    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(DataError::LabelOutOfRange { label, num_classes });
        }
        target[[row, label]] = 1f32;
    }

    Ok(target)
}

/// Index of the largest element (first one on ties)
pub fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, &x)| {
            if x > best.1 {
                (idx, x)
            } else {
                best
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn normalize_maps_into_centered_range() {
        let raw =
            Array::from_shape_fn((2, 16, 16), |(n, i, j)| ((n * 256 + i * 16 + j) % 256) as u8);
        let normalized = normalize(raw.view());

        assert!(normalized.iter().all(|x| (-0.5..=0.5).contains(x)));
        assert_eq!(normalized[[0, 0, 0]], -0.5);
        assert_eq!(normalized[[0, 15, 15]], 0.5);
    }

    #[test]
    fn expand_adds_single_channel() {
        let images = Array3::<f32>::zeros((3, IMAGE_SIDE, IMAGE_SIDE));
        let expanded = expand_channels(images);

        assert_eq!(expanded.shape(), &[3, IMAGE_SIDE, IMAGE_SIDE, 1]);
    }

    #[test]
    fn one_hot_sets_single_index() {
        let target = one_hot(&[3, 0, 9], NUM_CLASSES).unwrap();

        assert_eq!(target.shape(), &[3, NUM_CLASSES]);
        for (row, label) in target.axis_iter(Axis(0)).zip([3, 0, 9]) {
            assert_eq!(row.len(), NUM_CLASSES);
            assert_eq!(row[label], 1.0);
            assert_eq!(row.sum(), 1.0);
        }
    }

    #[test]
    fn one_hot_rejects_out_of_range_label() {
        let err = one_hot(&[1, 10], NUM_CLASSES).unwrap_err();

        assert!(matches!(err, DataError::LabelOutOfRange { label: 10, num_classes: 10 }));
    }

    #[test]
    fn dataset_requires_matching_counts() {
        let images = Array4::<f32>::zeros((4, 2, 2, 1));
        let target = Array2::<f32>::zeros((3, NUM_CLASSES));

        assert!(matches!(
            Dataset::new(images, target),
            Err(DataError::ShapeMismatch { images: 4, labels: 3 })
        ));
    }

    #[test]
    fn from_raw_runs_full_pipeline() {
        let raw = Array3::<u8>::from_elem((2, IMAGE_SIDE, IMAGE_SIDE), 255);
        let dataset = Dataset::from_raw(raw.view(), &[7, 2]).unwrap();

        assert_eq!(dataset.images.shape(), &[2, IMAGE_SIDE, IMAGE_SIDE, 1]);
        assert_eq!(dataset.target.shape(), &[2, NUM_CLASSES]);
        assert_eq!(dataset.labels().to_vec(), vec![7, 2]);
        assert!(dataset.images.iter().all(|x| *x == 0.5));
    }

    #[test]
    fn take_truncates_both_arrays() {
        let raw = Array3::<u8>::zeros((5, 4, 4));
        let dataset = Dataset::from_raw(raw.view(), &[0, 1, 2, 3, 4]).unwrap().take(2);

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.images.shape(), &[2, 4, 4, 1]);
        assert_eq!(dataset.labels().to_vec(), vec![0, 1]);
    }
}
