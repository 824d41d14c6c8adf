pub mod lu;

pub use lu::Lu;

use nalgebra::DVector;

/// `s_i = |y_i| + h |f(t,y)_i| + TINY`, the scale vector of §3, used to
/// weight single-step and Nordsieck-multistep error norms.
pub fn scale_vector(y: &DVector<f64>, h: f64, f: &DVector<f64>, tiny: f64) -> DVector<f64> {
    DVector::from_iterator(
        y.len(),
        y.iter()
            .zip(f.iter())
            .map(|(yi, fi)| yi.abs() + h.abs() * fi.abs() + tiny),
    )
}

/// `ewt_i = 1 / (rtol * |y_i| + atol_i)`, the CVODE-style error weight of
/// §4.4, used with [`weighted_rms`].
pub fn error_weights(rtol: f64, atol: &DVector<f64>, y: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        y.len(),
        y.iter()
            .zip(atol.iter())
            .map(|(yi, ai)| 1.0 / (rtol * yi.abs() + ai)),
    )
}

/// Weighted root-mean-square norm: `sqrt(mean((x_i * w_i)^2))`.
pub fn weighted_rms(x: &DVector<f64>, w: &DVector<f64>) -> f64 {
    let n = x.len() as f64;
    let sum_sq: f64 = x.iter().zip(w.iter()).map(|(xi, wi)| (xi * wi).powi(2)).sum();
    (sum_sq / n).sqrt()
}

/// Weighted max norm: `max_i |x_i * w_i|`, the single-step error metric (§3).
pub fn weighted_max(x: &DVector<f64>, w: &DVector<f64>) -> f64 {
    x.iter()
        .zip(w.iter())
        .map(|(xi, wi)| (xi * wi).abs())
        .fold(0.0_f64, f64::max)
}

/// `x ⊘ s`, componentwise division, used before applying a norm.
pub fn componentwise_div(x: &DVector<f64>, s: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(x.len(), x.iter().zip(s.iter()).map(|(xi, si)| xi / si))
}
