use anyhow::{Context, Result};
use clap::Parser;
use mnist_mlp::{
    config::Config,
    evaluate, mnist,
    mnist::{MnistSource, NUM_CLASSES},
    network::{NeuralNetwork, TrainingConfig},
    report,
    report::Sample,
};
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(&config)
}

fn run(config: &Config) -> Result<()> {
    info!("Loading MNIST dataset...");
    let source = MnistSource::new(&config.data_dir, !config.offline);
    let data = mnist::prepare(&source, config.test_size, config.seed)
        .context("failed to prepare the MNIST dataset")?;
    info!("Data prepared successfully.");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let input_size = data.train.features.ncols();
    let mut network = NeuralNetwork::new(input_size, config.hidden_size, NUM_CLASSES, &mut rng);

    info!(
        input_size,
        hidden_size = config.hidden_size,
        learning_rate = config.learning_rate,
        epochs = config.epochs,
        "Training the neural network..."
    );
    let losses = network
        .train_with(
            &data.train.features,
            &data.train_targets,
            TrainingConfig {
                learning_rate: config.learning_rate,
                epochs: config.epochs,
                log_interval: config.log_interval,
            },
        )
        .context("training failed")?;

    info!("Evaluating the model...");
    let evaluation = evaluate::evaluate(&network, &data.test).context("evaluation failed")?;
    let test_loss = NeuralNetwork::loss(&evaluation.output, &data.test_targets);
    info!(test_loss, "evaluated {} test samples", data.test.len());
    println!("Test Accuracy: {:.4}", evaluation.accuracy);

    report::loss_curve(&losses, &config.output_dir.join("loss.html"))
        .context("failed to plot the loss curve")?;

    let samples = report::choose_samples(data.test.len(), config.samples, &mut rng)
        .into_iter()
        .map(|index| Sample {
            pixels: data.test.features.row(index),
            label: data.test.labels[index],
            predicted: evaluation.predicted[index],
        })
        .collect::<Vec<_>>();
    if !samples.is_empty() {
        report::print_samples(&samples)?;
        report::sample_grid(&samples, &config.output_dir.join("samples.html"))
            .context("failed to plot sample predictions")?;
    }

    info!("Neural network implementation and evaluation completed.");
    Ok(())
}
