//! Two-layer perceptron for MNIST digits with forward and backward propagation written out by hand
//! over `ndarray` matrices.

pub mod activation;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod mnist;
pub mod network;
pub mod report;

pub use error::{Error, Result};
