//! Source operators: no inputs, output shape fixed by attributes.

use std::f32::consts::PI;

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::{Compiler, Kernel};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, Op};

// ============================================================================
// Arange
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ArangeParam {
    pub start: f32,
    pub stop: f32,
    pub step: f32,
}

impl Default for ArangeParam {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 0.0,
            step: 1.0,
        }
    }
}

/// `y[i] = start + i·step` for every `i` with `start + i·step` short of `stop`.
#[derive(Debug)]
pub struct Arange {
    param: ArangeParam,
    kernel: Option<Kernel>,
}

impl Arange {
    pub fn new(param: ArangeParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn len(&self) -> Result<usize> {
        let ArangeParam { start, stop, step } = self.param;
        if step == 0.0 || !step.is_finite() {
            return Err(NnrtError::InvalidAttribute {
                function: self.kind().to_string(),
                message: format!("step must be finite and non-zero, got {step}"),
            });
        }
        Ok(((stop - start) / step).ceil().max(0.0) as usize)
    }
}

impl Op for Arange {
    fn kind(&self) -> &'static str {
        "Arange"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 0, 0)?;
        Ok(vec![Shape::new(&[self.len()?])])
    }

    fn setup(&mut self, compiler: &Compiler, _inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let ArangeParam { start, step, .. } = self.param;
        let kernel = compiler.element("arange", outputs[0].numel(), move |i, _| start + i as f32 * step);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, _inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[])?])
    }
}

// ============================================================================
// Randn
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RandnParam {
    pub mu: f32,
    pub sigma: f32,
    pub shape: Vec<i64>,
    /// Negative draws a fresh entropy seed.
    pub seed: i64,
}

impl Default for RandnParam {
    fn default() -> Self {
        Self {
            mu: 0.0,
            sigma: 1.0,
            shape: Vec::new(),
            seed: -1,
        }
    }
}

/// Approximate normal samples from a polynomial warp of uniform draws:
/// `t = 2u − 1`, `v = (t + π/12·t³ + 7π/480·t⁵)·√(2π)/2`, `y = mu + v·sigma`.
///
/// Every forward draws new samples; a non-negative seed makes the sequence
/// across forwards reproducible.
#[derive(Debug)]
pub struct Randn {
    param: RandnParam,
    rng: Mutex<StdRng>,
    kernel: Option<Kernel>,
}

impl Randn {
    pub fn new(param: RandnParam) -> Self {
        let rng = match u64::try_from(param.seed) {
            Ok(seed) => StdRng::seed_from_u64(seed),
            Err(_) => StdRng::from_entropy(),
        };
        Self {
            param,
            rng: Mutex::new(rng),
            kernel: None,
        }
    }
}

#[inline]
fn warp(u: f32) -> f32 {
    let t = 2.0 * u - 1.0;
    let v = t + (PI / 12.0) * t.powi(3) + (7.0 * PI / 480.0) * t.powi(5);
    v * (2.0 * PI).sqrt() / 2.0
}

impl Op for Randn {
    fn kind(&self) -> &'static str {
        "Randn"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 0, 0)?;
        let shape = Shape::from_declared(&self.param.shape).ok_or_else(|| NnrtError::InvalidAttribute {
            function: self.kind().to_string(),
            message: format!("shape {:?} has a zero dimension", self.param.shape),
        })?;
        Ok(vec![shape])
    }

    fn setup(&mut self, compiler: &Compiler, _inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let n = outputs[0].numel();
        let (mu, sigma) = (self.param.mu, self.param.sigma);
        let kernel = compiler
            .element("randn", n, move |i, args| mu + warp(args[0][i]) * sigma)
            .with_arg_lens(&[n]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, _inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let uniforms: Vec<f32> = {
            let mut rng = self.rng.lock();
            (0..kernel.output_len()).map(|_| rng.gen::<f32>()).collect()
        };
        Ok(vec![kernel.dispatch(&[&Payload::Host(uniforms)])?])
    }
}
