use super::{DataError, Dataset};
use log::info;
use ndarray::{Array, Array3, Dimension, Ix1};
use ndarray_npy::{NpzReader, ReadNpzError, ReadableElement};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name numpy gives to the first positional array of `np.savez`
const ARRAY_NAME: &str = "arr_0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Paths of the image and label archives of a split, e.g. `kmnist-train-imgs.npz`
pub fn split_paths(dir: &Path, prefix: &str, split: Split) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}-{}-imgs.npz", prefix, split.as_str())),
        dir.join(format!("{}-{}-labels.npz", prefix, split.as_str())),
    )
}

/// Load one split and run it through normalization and one-hot encoding
pub fn load_split(dir: &Path, prefix: &str, split: Split) -> Result<Dataset, DataError> {
    let (images_path, labels_path) = split_paths(dir, prefix, split);

    let images: Array3<u8> = load_npz_array(&images_path)?;
    let labels = load_labels(&labels_path)?;
    let dataset = Dataset::from_raw(images.view(), &labels)?;

    info!(
        "Loaded {} split: images {:?}, target {:?}",
        split.as_str(),
        dataset.images.shape(),
        dataset.target.shape()
    );

    Ok(dataset)
}

/// Read the single named array of a `.npz` archive
pub fn load_npz_array<A, D>(path: &Path) -> Result<Array<A, D>, DataError>
where
    A: ReadableElement,
    D: Dimension,
{
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_owned(),
        source,
    })?;
    let npz_err = |source: ReadNpzError| DataError::Npz {
        path: path.to_owned(),
        source,
    };
    let mut npz = NpzReader::new(file).map_err(npz_err)?;
    let names = npz.names().map_err(npz_err)?;

    // Entries may or may not carry the `.npy` extension depending on the writer
    let name = names
        .iter()
        .find(|name| name.trim_end_matches(".npy") == ARRAY_NAME)
        .or_else(|| names.first())
        .cloned()
        .ok_or_else(|| DataError::EmptyArchive {
            path: path.to_owned(),
        })?;

    npz.by_name(&name).map_err(npz_err)
}

/// Labels are stored as `u8` by the dataset authors, but re-saved archives often hold `i64`
fn load_labels(path: &Path) -> Result<Vec<usize>, DataError> {
    match load_npz_array::<u8, Ix1>(path) {
        Ok(labels) => Ok(labels.iter().map(|x| *x as usize).collect()),
        Err(DataError::Npz { .. }) => {
            let labels = load_npz_array::<i64, Ix1>(path)?;

            labels
                .iter()
                .enumerate()
                .map(|(record, x)| {
                    usize::try_from(*x).map_err(|_| DataError::Malformed {
                        record,
                        reason: format!("negative label {}", x),
                    })
                })
                .collect()
        }
        Err(err) => Err(err),
    }
}
