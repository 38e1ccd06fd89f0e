use clap::Parser;
use std::path::PathBuf;

/// Train a 784-128-10 perceptron on MNIST with hand-written backpropagation.
///
/// Every option has a default, so running with no arguments performs the standard run.
#[derive(Parser, Debug, Clone)]
#[command(name = "mnist-mlp", version, long_about = None)]
pub struct Config {
    /// Directory holding the gzipped MNIST IDX files
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Fail instead of downloading missing dataset files
    #[arg(long)]
    pub offline: bool,

    /// Neurons in the hidden layer
    #[arg(long, default_value_t = 128)]
    pub hidden_size: usize,

    #[arg(long, default_value_t = 0.1)]
    pub learning_rate: f64,

    /// Full-batch gradient descent steps
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Fraction of the samples held out for testing
    #[arg(long, default_value_t = 0.2)]
    pub test_size: f64,

    /// Seed for the train/test split, weight initialization and sample selection
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Log the training loss every N epochs
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    /// Number of test images shown with their predictions
    #[arg(long, default_value_t = 5)]
    pub samples: usize,

    /// Where the loss curve and sample plots are written
    #[arg(long, default_value = "plots")]
    pub output_dir: PathBuf,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_standard_run() {
        let config = Config::parse_from(["mnist-mlp"]);
        assert_eq!(config.hidden_size, 128);
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.epochs, 100);
        assert_eq!(config.test_size, 0.2);
        assert_eq!(config.seed, 42);
        assert_eq!(config.log_interval, 10);
        assert_eq!(config.samples, 5);
        assert!(!config.offline);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "mnist-mlp",
            "--epochs",
            "3",
            "--learning-rate",
            "0.5",
            "--offline",
            "--output-dir",
            "out",
        ]);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.learning_rate, 0.5);
        assert!(config.offline);
        assert_eq!(config.output_dir, PathBuf::from("out"));
    }
}
