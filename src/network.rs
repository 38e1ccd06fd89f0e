use crate::activation::{relu, relu_derivative, sigmoid};
use crate::error::{Error, Result};
use ndarray::{Array2, Axis};
use ndarray_rand::{RandomExt, rand::Rng, rand_distr::StandardNormal};
use tracing::{debug, info, warn};

// A fully connected network with one ReLU hidden layer and a sigmoid output layer. Samples are
// rows, so a batch X of shape [n x input_size] maps to an output of shape [n x output_size].
pub struct NeuralNetwork {
    pub w1: Array2<f64>,
    pub b1: Array2<f64>,
    pub w2: Array2<f64>,
    pub b2: Array2<f64>,
}

// The intermediate values of one forward pass. Backpropagation needs a1 and a2, so the pass is
// handed back to the caller instead of being kept on the network.
pub struct ForwardPass {
    pub z1: Array2<f64>,
    pub a1: Array2<f64>,
    pub z2: Array2<f64>,
    pub a2: Array2<f64>,
}

// Gradients of the loss with respect to each parameter, shaped like the parameter itself.
pub struct Gradients {
    pub dw1: Array2<f64>,
    pub db1: Array2<f64>,
    pub dw2: Array2<f64>,
    pub db2: Array2<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    /// Log the loss every this many epochs. Zero disables progress logging.
    pub log_interval: usize,
}

impl NeuralNetwork {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        rng: &mut R,
    ) -> NeuralNetwork {
        // Standard normal weights shrunk by 1/sqrt(fan_in) so the pre-activations of each layer
        // start out with roughly unit variance. Biases start at zero.
        let w1 = Array2::<f64>::random_using((input_size, hidden_size), StandardNormal, rng)
            / (input_size as f64).sqrt();
        let w2 = Array2::<f64>::random_using((hidden_size, output_size), StandardNormal, rng)
            / (hidden_size as f64).sqrt();

        NeuralNetwork {
            w1,
            b1: Array2::zeros((1, hidden_size)),
            w2,
            b2: Array2::zeros((1, output_size)),
        }
    }

    pub fn input_size(&self) -> usize {
        self.w1.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.w2.ncols()
    }

    pub fn forward(&self, x: &Array2<f64>) -> Result<ForwardPass> {
        if x.ncols() != self.input_size() {
            return Err(Error::shape("forward input columns", self.input_size(), x.ncols()));
        }

        // The [1 x size] bias rows broadcast across every sample.
        let z1 = x.dot(&self.w1) + &self.b1;
        let a1 = relu(&z1);
        let z2 = a1.dot(&self.w2) + &self.b2;
        let a2 = sigmoid(&z2);

        Ok(ForwardPass { z1, a1, z2, a2 })
    }

    // The network's output for X, i.e. an independent probability per class. Rows do not sum to 1.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(self.forward(x)?.a2)
    }

    pub fn backward(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        pass: &ForwardPass,
    ) -> Result<Gradients> {
        if y.dim() != pass.a2.dim() {
            return Err(Error::shape("backward targets", pass.a2.dim(), y.dim()));
        }
        if x.nrows() != y.nrows() || x.ncols() != self.input_size() {
            return Err(Error::shape(
                "backward input",
                (y.nrows(), self.input_size()),
                x.dim(),
            ));
        }

        let m = x.nrows() as f64;

        // Sigmoid outputs scored with binary cross-entropy: the σ'(z2) factor cancels against the
        // derivative of the loss, leaving just the prediction error.
        let dz2 = &pass.a2 - y;
        let dw2 = pass.a1.t().dot(&dz2) / m;
        let db2 = dz2.sum_axis(Axis(0)).insert_axis(Axis(0)) / m;

        let dz1 = dz2.dot(&self.w2.t()) * relu_derivative(&pass.a1);
        let dw1 = x.t().dot(&dz1) / m;
        let db1 = dz1.sum_axis(Axis(0)).insert_axis(Axis(0)) / m;

        Ok(Gradients { dw1, db1, dw2, db2 })
    }

    pub fn apply_gradients(&mut self, gradients: &Gradients, learning_rate: f64) {
        self.w1.scaled_add(-learning_rate, &gradients.dw1);
        self.b1.scaled_add(-learning_rate, &gradients.db1);
        self.w2.scaled_add(-learning_rate, &gradients.dw2);
        self.b2.scaled_add(-learning_rate, &gradients.db2);
    }

    // Mean binary cross-entropy over every sample and every output unit. Outputs that saturate to
    // exactly 0 or 1 are not clamped, so the result can be infinite or NaN.
    pub fn loss(output: &Array2<f64>, y: &Array2<f64>) -> f64 {
        let total = ndarray::Zip::from(output)
            .and(y)
            .fold(0.0, |acc, &p, &t| acc + t * p.ln() + (1.0 - t) * (1.0 - p).ln());
        -total / output.len() as f64
    }

    pub fn train(
        &mut self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        learning_rate: f64,
        epochs: usize,
    ) -> Result<Vec<f64>> {
        self.train_with(
            x,
            y,
            TrainingConfig {
                learning_rate,
                epochs,
                log_interval: 10,
            },
        )
    }

    // Full-batch gradient descent: every epoch runs the whole of X forward, computes the loss,
    // backpropagates and takes one step. Returns the loss of each epoch, measured before its step.
    pub fn train_with(
        &mut self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        config: TrainingConfig,
    ) -> Result<Vec<f64>> {
        if x.nrows() != y.nrows() {
            return Err(Error::shape("training samples", x.nrows(), y.nrows()));
        }
        if y.ncols() != self.output_size() {
            return Err(Error::shape("training target columns", self.output_size(), y.ncols()));
        }
        if x.nrows() == 0 {
            return Err(Error::EmptyInput("cannot train on zero samples"));
        }

        let mut losses = Vec::with_capacity(config.epochs);
        let mut warned = false;

        for epoch in 0..config.epochs {
            let pass = self.forward(x)?;
            let loss = Self::loss(&pass.a2, y);

            if !loss.is_finite() && !warned {
                let peak_logit = pass.z2.iter().fold(0.0_f64, |peak, z| peak.max(z.abs()));
                warn!(epoch, loss, peak_logit, "loss is not finite; outputs have saturated");
                warned = true;
            }

            let gradients = self.backward(x, y, &pass)?;
            self.apply_gradients(&gradients, config.learning_rate);
            losses.push(loss);

            if config.log_interval > 0 && epoch % config.log_interval == 0 {
                info!("Epoch {epoch}, Loss: {loss}");
                let inactive = pass.z1.iter().filter(|&&z| z <= 0.0).count();
                debug!(
                    epoch,
                    inactive_fraction = inactive as f64 / pass.z1.len() as f64,
                    "hidden layer activity"
                );
            }
        }

        Ok(losses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

    fn network(input: usize, hidden: usize, output: usize, seed: u64) -> NeuralNetwork {
        NeuralNetwork::new(input, hidden, output, &mut StdRng::seed_from_u64(seed))
    }

    // Two clusters on either side of x0 = 0, one class each.
    fn separable() -> (Array2<f64>, Array2<f64>) {
        let x = array![[-2.0, 1.0], [-1.5, -1.0], [1.5, 1.0], [2.0, -1.0]];
        let y = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        (x, y)
    }

    #[test]
    fn parameters_have_expected_shapes() {
        let net = network(784, 128, 10, 0);
        assert_eq!(net.w1.dim(), (784, 128));
        assert_eq!(net.b1.dim(), (1, 128));
        assert_eq!(net.w2.dim(), (128, 10));
        assert_eq!(net.b2.dim(), (1, 10));
        assert!(net.b1.iter().chain(net.b2.iter()).all(|&b| b == 0.0));
    }

    #[test]
    fn forward_output_shape_follows_batch_size() {
        let net = network(6, 5, 3, 1);
        for n in [1, 2, 17] {
            let x = Array2::from_shape_fn((n, 6), |(i, j)| (i as f64 - j as f64) / 4.0);
            let pass = net.forward(&x).unwrap();
            assert_eq!(pass.a2.dim(), (n, 3));
            assert_eq!(pass.a1.dim(), (n, 5));
            assert!(pass.a2.iter().all(|&p| p > 0.0 && p < 1.0));
        }
    }

    #[test]
    fn forward_rejects_wrong_feature_count() {
        let net = network(4, 3, 2, 0);
        assert!(matches!(
            net.forward(&Array2::zeros((2, 5))),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn backward_rejects_mismatched_targets() {
        let net = network(4, 3, 2, 0);
        let x = Array2::zeros((2, 4));
        let pass = net.forward(&x).unwrap();
        assert!(net.backward(&x, &Array2::zeros((2, 3)), &pass).is_err());
        assert!(net.backward(&Array2::zeros((3, 4)), &Array2::zeros((2, 2)), &pass).is_err());
    }

    #[test]
    fn train_rejects_mismatched_samples() {
        let mut net = network(2, 3, 2, 0);
        let (x, _) = separable();
        assert!(net.train(&x, &Array2::zeros((3, 2)), 0.1, 1).is_err());
        assert!(net.train(&x, &Array2::zeros((4, 3)), 0.1, 1).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let net = network(3, 4, 2, 7);
        let x = array![[0.5, -1.0, 2.0], [1.5, 0.3, -0.7], [-0.2, 0.8, 0.1]];
        let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let pass = net.forward(&x).unwrap();
        let gradients = net.backward(&x, &y, &pass).unwrap();

        // backward averages over samples but not over output units, so it is the gradient of
        // loss * output_size.
        let scaled_loss = |net: &NeuralNetwork| {
            NeuralNetwork::loss(&net.predict(&x).unwrap(), &y) * net.output_size() as f64
        };
        let h = 1e-6;

        let mut perturbed = network(3, 4, 2, 7);
        for ((i, j), &analytic) in gradients.dw1.indexed_iter() {
            perturbed.w1[[i, j]] += h;
            let plus = scaled_loss(&perturbed);
            perturbed.w1[[i, j]] -= 2.0 * h;
            let minus = scaled_loss(&perturbed);
            perturbed.w1[[i, j]] += h;
            assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * h), epsilon = 1e-5);
        }
        for ((i, j), &analytic) in gradients.dw2.indexed_iter() {
            perturbed.w2[[i, j]] += h;
            let plus = scaled_loss(&perturbed);
            perturbed.w2[[i, j]] -= 2.0 * h;
            let minus = scaled_loss(&perturbed);
            perturbed.w2[[i, j]] += h;
            assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * h), epsilon = 1e-5);
        }
        for (j, &analytic) in gradients.db2.iter().enumerate() {
            perturbed.b2[[0, j]] += h;
            let plus = scaled_loss(&perturbed);
            perturbed.b2[[0, j]] -= 2.0 * h;
            let minus = scaled_loss(&perturbed);
            perturbed.b2[[0, j]] += h;
            assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * h), epsilon = 1e-5);
        }
        for (j, &analytic) in gradients.db1.iter().enumerate() {
            perturbed.b1[[0, j]] += h;
            let plus = scaled_loss(&perturbed);
            perturbed.b1[[0, j]] -= 2.0 * h;
            let minus = scaled_loss(&perturbed);
            perturbed.b1[[0, j]] += h;
            assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * h), epsilon = 1e-5);
        }
    }

    #[test]
    fn loss_drops_on_separable_data() {
        let (x, y) = separable();
        let mut net = network(2, 8, 2, 3);

        let losses = net.train(&x, &y, 0.5, 2).unwrap();

        assert_eq!(losses.len(), 2);
        assert!(losses[1] < losses[0], "{losses:?}");
    }

    #[test]
    fn same_seed_gives_identical_history() {
        let (x, y) = separable();
        let first = network(2, 5, 2, 42).train(&x, &y, 0.5, 20).unwrap();
        let second = network(2, 5, 2, 42).train(&x, &y, 0.5, 20).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn single_sample_step_keeps_shapes() {
        let mut net = network(4, 3, 2, 11);
        let x = array![[1.0, 0.0, 1.0, 0.0]];
        let y = array![[1.0, 0.0]];
        let before = net.w1.clone();

        let losses = net.train(&x, &y, 0.5, 1).unwrap();

        assert_eq!(net.w1.dim(), (4, 3));
        assert_eq!(net.w2.dim(), (3, 2));
        assert_eq!(losses.len(), 1);
        assert!(losses[0].is_finite() && losses[0] >= 0.0);
        // Inputs that are zero receive no gradient.
        assert_eq!(net.w1.row(1), before.row(1));
        assert_eq!(net.w1.row(3), before.row(3));
    }

    #[test]
    fn loss_of_saturated_output_is_not_clamped() {
        let output = array![[1.0, 0.5]];
        let y = array![[0.0, 1.0]];
        assert!(NeuralNetwork::loss(&output, &y).is_infinite());

        let fine = NeuralNetwork::loss(&array![[0.5, 0.5]], &array![[1.0, 0.0]]);
        assert_abs_diff_eq!(fine, std::f64::consts::LN_2, epsilon = 1e-12);
    }
}
