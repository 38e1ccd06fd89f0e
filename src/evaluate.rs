use crate::error::{Error, Result};
use crate::mnist::Dataset;
use crate::network::NeuralNetwork;
use ndarray::{Array1, Array2, Axis};

pub struct Evaluation {
    /// Raw network output, one row per sample.
    pub output: Array2<f64>,
    pub predicted: Array1<usize>,
    pub accuracy: f64,
}

// Index of the highest output in each row. On a tie the first column wins, and NaN never beats a
// number.
pub fn predicted_classes(output: &Array2<f64>) -> Array1<usize> {
    output.map_axis(Axis(1), |row| {
        row.iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, best_value), (index, &value)| {
                if value > best_value {
                    (index, value)
                } else {
                    (best, best_value)
                }
            })
            .0
    })
}

pub fn accuracy(predicted: &Array1<usize>, labels: &Array1<u8>) -> Result<f64> {
    if predicted.len() != labels.len() {
        return Err(Error::shape("accuracy", labels.len(), predicted.len()));
    }
    if predicted.is_empty() {
        return Err(Error::EmptyInput("accuracy of zero predictions"));
    }

    let correct = predicted
        .iter()
        .zip(labels.iter())
        .filter(|&(&prediction, &label)| prediction == label as usize)
        .count();

    Ok(correct as f64 / predicted.len() as f64)
}

// Run the network on the whole dataset and score it against the labels.
pub fn evaluate(network: &NeuralNetwork, dataset: &Dataset) -> Result<Evaluation> {
    let output = network.predict(&dataset.features)?;
    let predicted = predicted_classes(&output);
    let accuracy = accuracy(&predicted, &dataset.labels)?;
    Ok(Evaluation {
        output,
        predicted,
        accuracy,
    })
}
