use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis, concatenate};
use ndarray_rand::rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

pub const NUM_CLASSES: usize = 10;
pub const IMAGE_SIDE: usize = 28;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;
const MIRROR_URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist";

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte.gz";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte.gz";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte.gz";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte.gz";

// A set of samples. Each row of `features` is one image flattened to 784 values, and the label in
// the same position of `labels` is the digit it shows.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub labels: Array1<u8>,
}

impl Dataset {
    pub fn new(features: Array2<f64>, labels: Array1<u8>) -> Result<Dataset> {
        if features.nrows() != labels.len() {
            return Err(Error::shape("dataset", labels.len(), features.nrows()));
        }
        Ok(Dataset { features, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }
}

// Everything the training run needs: standardized partitions, their one-hot targets, and the
// scaler that was fitted on the training partition (kept for scaling new images).
pub struct PreparedData {
    pub train: Dataset,
    pub test: Dataset,
    pub train_targets: Array2<f64>,
    pub test_targets: Array2<f64>,
    pub scaler: StandardScaler,
}

// Where the gzipped IDX files live, and whether missing ones may be downloaded.
pub struct MnistSource {
    data_dir: PathBuf,
    download: bool,
}

impl MnistSource {
    pub fn new(data_dir: impl Into<PathBuf>, download: bool) -> MnistSource {
        MnistSource {
            data_dir: data_dir.into(),
            download,
        }
    }

    // Reads both halves of the distributed files and stacks them into a single 70000 sample
    // dataset, which is then split with `train_test_split`.
    pub fn load_all(&self) -> Result<Dataset> {
        let training = self.load_pair(TRAIN_IMAGES, TRAIN_LABELS)?;
        let test = self.load_pair(TEST_IMAGES, TEST_LABELS)?;

        let features = concatenate(Axis(0), &[training.features.view(), test.features.view()])
            .map_err(|e| Error::MalformedIdx(format!("image sizes differ between files: {e}")))?;
        let labels = concatenate(Axis(0), &[training.labels.view(), test.labels.view()])
            .map_err(|e| Error::MalformedIdx(e.to_string()))?;

        Dataset::new(features, labels)
    }

    fn load_pair(&self, images: &str, labels: &str) -> Result<Dataset> {
        let image_bytes = self.read_bytes(images)?;
        let label_bytes = self.read_bytes(labels)?;
        let dataset = images_and_labels_to_dataset(image_bytes, label_bytes)?;
        debug!(images, labels, samples = dataset.len(), "parsed IDX pair");
        Ok(dataset)
    }

    // Returns the decompressed contents of one of the MNIST files, fetching it first if it is not
    // on disk yet.
    fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.data_dir.join(name);
        if !path.exists() {
            if !self.download {
                return Err(Error::io(
                    &path,
                    std::io::Error::new(ErrorKind::NotFound, "missing and downloads are disabled"),
                ));
            }
            fetch(&format!("{MIRROR_URL}/{name}"), &path)?;
        }

        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut unzipped_file = GzDecoder::new(file);
        let mut bytes = Vec::new();
        unzipped_file
            .read_to_end(&mut bytes)
            .map_err(|e| Error::io(&path, e))?;
        Ok(bytes)
    }
}

fn fetch(url: &str, destination: &Path) -> Result<()> {
    let fetch_error = |reason: String| Error::DataFetch {
        url: url.to_string(),
        reason,
    };

    info!(url, "downloading");
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| fetch_error(e.to_string()))?;
    let response = client.get(url).send().map_err(|e| fetch_error(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fetch_error(format!("HTTP {}", response.status())));
    }
    let body = response.bytes().map_err(|e| fetch_error(e.to_string()))?;

    save(destination, &body)?;
    debug!(path = %destination.display(), bytes = body.len(), "saved");
    Ok(())
}

// Writes into a `.part` file beside the destination and renames it into place once complete, so
// an interrupted write never leaves a truncated file under the real name.
fn save(destination: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;

    let prefix = destination
        .file_name()
        .map(|name| format!("{}.", name.to_string_lossy()))
        .unwrap_or_default();
    let mut partial = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| Error::io(parent, e))?;
    partial
        .write_all(bytes)
        .and_then(|_| partial.as_file().sync_all())
        .map_err(|e| Error::io(partial.path(), e))?;
    partial
        .persist(destination)
        .map_err(|e| Error::io(destination, e.error))?;
    Ok(())
}

// Reads `count` big-endian u32 header fields from the front of the iterator.
fn read_header(bytes: &mut impl Iterator<Item = u8>, count: usize) -> Result<Vec<u32>> {
    let header_bytes = bytes.by_ref().take(count * 4).collect::<Vec<_>>();
    if header_bytes.len() != count * 4 {
        return Err(Error::MalformedIdx(format!(
            "header needs {} bytes, found {}",
            count * 4,
            header_bytes.len()
        )));
    }
    Ok(header_bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// Turns the raw (already decompressed) bytes of an IDX image file and its IDX label file into a
// dataset. Images are flattened into rows and their pixel bytes scaled to [0, 1].
pub fn images_and_labels_to_dataset(image_bytes: Vec<u8>, label_bytes: Vec<u8>) -> Result<Dataset> {
    let mut image_bytes_iter = image_bytes.into_iter();
    let mut label_bytes_iter = label_bytes.into_iter();

    // Image header: magic number, number of images, rows per image, columns per image.
    let image_header = read_header(&mut image_bytes_iter, 4)?;
    if image_header[0] != IMAGE_MAGIC {
        return Err(Error::MalformedIdx(format!(
            "image magic number is {}, expected {IMAGE_MAGIC}",
            image_header[0]
        )));
    }
    let images = image_header[1] as usize;
    let pixels = (image_header[2] as usize)
        .checked_mul(image_header[3] as usize)
        .ok_or_else(|| Error::MalformedIdx("image dimensions overflow".to_string()))?;

    // Label header: magic number, number of labels.
    let label_header = read_header(&mut label_bytes_iter, 2)?;
    if label_header[0] != LABEL_MAGIC {
        return Err(Error::MalformedIdx(format!(
            "label magic number is {}, expected {LABEL_MAGIC}",
            label_header[0]
        )));
    }
    let labels = label_header[1] as usize;

    if images != labels {
        return Err(Error::shape("IDX image/label counts", images, labels));
    }
    if pixels == 0 {
        return Err(Error::MalformedIdx("images have zero pixels".to_string()));
    }
    let pixel_count = images
        .checked_mul(pixels)
        .ok_or_else(|| Error::MalformedIdx("pixel count overflows".to_string()))?;
    if image_bytes_iter.len() < pixel_count {
        return Err(Error::MalformedIdx(format!(
            "expected {pixel_count} pixel bytes, found {}",
            image_bytes_iter.len()
        )));
    }

    let pixel_values = image_bytes_iter
        .chunks(pixels)
        .into_iter()
        .take(images)
        .flat_map(|chunk| chunk.map(|value| value as f64 / 255.0).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    if pixel_values.len() != pixel_count {
        return Err(Error::MalformedIdx(format!(
            "expected {pixel_count} pixel bytes, found {}",
            pixel_values.len()
        )));
    }

    let label_values = label_bytes_iter.take(labels).collect::<Vec<_>>();
    if label_values.len() != labels {
        return Err(Error::MalformedIdx(format!(
            "expected {labels} label bytes, found {}",
            label_values.len()
        )));
    }

    let features = Array2::from_shape_vec((images, pixels), pixel_values)
        .map_err(|e| Error::MalformedIdx(e.to_string()))?;
    Dataset::new(features, Array1::from_vec(label_values))
}

// Shuffles the sample order with a seeded generator and carves off the first
// ceil(n * test_fraction) samples as the test partition. Returns (train, test).
pub fn train_test_split(
    dataset: &Dataset,
    test_fraction: f64,
    seed: u64,
) -> Result<(Dataset, Dataset)> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(Error::InvalidConfig(format!(
            "test fraction must be between 0 and 1, got {test_fraction}"
        )));
    }

    let mut indices = (0..dataset.len()).collect::<Vec<_>>();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test_len = (dataset.len() as f64 * test_fraction).ceil() as usize;
    let (test_indices, train_indices) = indices.split_at(test_len.min(dataset.len()));

    Ok((dataset.select(train_indices), dataset.select(test_indices)))
}

// Per-feature standardization. Fitted on training features only and then applied unchanged to
// every partition.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(features: &Array2<f64>) -> Result<StandardScaler> {
        let mean = features
            .mean_axis(Axis(0))
            .ok_or(Error::EmptyInput("cannot fit a scaler on zero samples"))?;
        // Constant features would divide by zero; leave them unscaled so they simply become 0.
        let scale = features
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std == 0.0 { 1.0 } else { std });
        Ok(StandardScaler { mean, scale })
    }

    pub fn transform(&self, features: &Array2<f64>) -> Result<Array2<f64>> {
        if features.ncols() != self.mean.len() {
            return Err(Error::shape(
                "scaler transform",
                self.mean.len(),
                features.ncols(),
            ));
        }
        Ok((features - &self.mean) / &self.scale)
    }
}

// Turns each label into a row with 1.0 in the column of that label and 0.0 everywhere else.
pub fn one_hot(labels: &Array1<u8>, num_classes: usize) -> Result<Array2<f64>> {
    if let Some(&label) = labels.iter().find(|&&label| label as usize >= num_classes) {
        return Err(Error::InvalidLabel {
            label: label as usize,
            num_classes,
        });
    }
    Ok(Array2::from_shape_fn((labels.len(), num_classes), |(i, j)| {
        if j == labels[i] as usize { 1.0 } else { 0.0 }
    }))
}

// Loads, splits, standardizes and one-hot encodes in one go.
pub fn prepare(source: &MnistSource, test_fraction: f64, seed: u64) -> Result<PreparedData> {
    let dataset = source.load_all()?;
    info!(samples = dataset.len(), features = dataset.features.ncols(), "loaded MNIST");

    let (train, test) = train_test_split(&dataset, test_fraction, seed)?;
    drop(dataset);
    info!(train = train.len(), test = test.len(), seed, "split dataset");

    let scaler = StandardScaler::fit(&train.features)?;
    let train = Dataset::new(scaler.transform(&train.features)?, train.labels)?;
    let test = Dataset::new(scaler.transform(&test.features)?, test.labels)?;

    let train_targets = one_hot(&train.labels, NUM_CLASSES)?;
    let test_targets = one_hot(&test.labels, NUM_CLASSES)?;

    Ok(PreparedData {
        train,
        test,
        train_targets,
        test_targets,
        scaler,
    })
}
