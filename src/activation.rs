use ndarray::{Array, ArrayBase, Data, Dimension};

// All four functions work element-wise on arrays of any dimension and return a freshly allocated
// array of the same shape.

pub fn sigmoid<S, D>(x: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    x.mapv(|z| 1.0 / (1.0 + f64::exp(-z)))
}

// Takes the output of sigmoid, not its input: if a = σ(z) then dσ/dz = a(1 - a).
pub fn sigmoid_derivative<S, D>(a: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    a.mapv(|a| a * (1.0 - a))
}

pub fn relu<S, D>(x: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    x.mapv(|z| z.max(0.0))
}

// Also takes the activated value. relu(z) > 0 exactly when z > 0, so the sign test gives the same
// answer either way.
pub fn relu_derivative<S, D>(a: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    a.mapv(|a| if a > 0.0 { 1.0 } else { 0.0 })
}
