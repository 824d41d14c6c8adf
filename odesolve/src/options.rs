//! Option bundles crossing the IVP boundary (§6.1-§6.3). Both bundles derive
//! `serde::{Serialize, Deserialize}` with `#[serde(default)]` so a host
//! binding (out of scope per §1, but a boundary this crate must not
//! foreclose) can hand over a plain JSON/CBOR blob instead of constructing
//! the struct directly.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// `lmm` (§6.2): which linear multistep family the variable-order BDF
/// integrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lmm {
    Adams,
    Bdf,
}

impl Default for Lmm {
    fn default() -> Self {
        Lmm::Bdf
    }
}

/// Scalar or per-component absolute tolerance (§6.2's "scalar or per-component
/// absolute tolerance").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Atol {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Default for Atol {
    fn default() -> Self {
        Atol::Scalar(1e-6)
    }
}

impl Atol {
    pub fn as_vector(&self, dim: usize) -> DVector<f64> {
        match self {
            Atol::Scalar(a) => DVector::from_element(dim, *a),
            Atol::Vector(v) => DVector::from_vec(v.clone()),
        }
    }
}

/// Recognised options for [`crate::cvode::CvodeIntegrator`] (§6.2). Unknown
/// keys during deserialization are simply ignored (serde's default
/// behaviour); a malformed map falls back to [`Options::default`] at the call
/// site, per §6.3's "malformed maps fall back to defaults" rule extended
/// here to the CVODE option bundle as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub lmm: Lmm,
    pub rtol: f64,
    pub atol: Atol,
    pub max_steps: u32,
    pub max_order: Option<u32>,
    pub max_step: Option<f64>,
    pub min_step: f64,
    pub init_step: Option<f64>,
    pub stop_time: Option<f64>,
    pub n_roots: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lmm: Lmm::Bdf,
            rtol: 1e-4,
            atol: Atol::default(),
            max_steps: 500,
            max_order: None,
            max_step: None,
            min_step: 0.0,
            init_step: None,
            stop_time: None,
            n_roots: 0,
        }
    }
}

impl Options {
    /// Clamps `max_order` to the family maximum (Adams 12, BDF 5), per §6.2.
    pub fn clamped_max_order(&self) -> u32 {
        let family_max = match self.lmm {
            Lmm::Adams => 12,
            Lmm::Bdf => 5,
        };
        self.max_order.map(|m| m.min(family_max)).unwrap_or(family_max)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        if self.rtol < 0.0 {
            return Err(Error::InvalidInput("rtol must be >= 0".into()));
        }
        match &self.atol {
            Atol::Scalar(a) if *a < 0.0 => {
                return Err(Error::InvalidInput("atol must be >= 0".into()))
            }
            Atol::Vector(v) if v.iter().any(|a| *a < 0.0) => {
                return Err(Error::InvalidInput("atol components must be >= 0".into()))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Which single-step or multistep method the Nordsieck switcher's
/// method-selection map (§6.3) names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodName {
    Mrt,
    Ros3prw,
    Ros34prw,
    Rk3,
    Rk4,
    Rkdp,
    Ab4,
    Ab5,
    Lsoda,
    Cvode,
}

impl Default for MethodName {
    /// Unknown method names fall back to `ros34prw`, per §9's "Dynamic
    /// dispatch on method name... Unknown entries fall back to the default
    /// (ros34prw)."
    fn default() -> Self {
        MethodName::Ros34prw
    }
}

/// The method-switching configuration map (§6.3): `{method, max_time_ms,
/// max_iterations}`. Unknown keys are ignored by serde's default behaviour;
/// a malformed map (one that fails to deserialize at all) falls back to
/// `MethodOptions::default()` at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOptions {
    pub method: MethodName,
    /// `-1` means unbounded (§6.3).
    pub max_time_ms: i64,
    /// `None` means unbounded.
    pub max_iterations: Option<u64>,
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            method: MethodName::default(),
            max_time_ms: -1,
            max_iterations: None,
        }
    }
}

impl MethodOptions {
    /// A caller that deserializes this struct from a host-supplied blob
    /// (via whatever `serde` data format it already depends on) should treat
    /// a `Result::Err` from that call as "malformed" and substitute
    /// `MethodOptions::default()` wholesale rather than partially applying
    /// recognised fields, per §6.3.
    pub fn or_default(parsed: Result<Self, impl std::fmt::Display>) -> Self {
        parsed.unwrap_or_else(|_| MethodOptions::default())
    }
}
