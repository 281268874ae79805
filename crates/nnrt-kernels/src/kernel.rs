//! Kernel compilation and dispatch.
//!
//! A kernel is compiled once from a body closure, an output length and the
//! constants the closure captures. Dispatching it against positional payload
//! arguments computes every output element (in parallel for element bodies)
//! and yields either a device-resident or a host payload.
//!
//! ```ignore
//! let scale = 0.5f32;
//! let kernel = compiler.element("scale", n, move |i, args| args[0][i] * scale);
//! let y = kernel.dispatch(&[&x])?;
//! ```

use std::fmt;
use std::sync::Arc;

use nnrt_core::{DeviceContext, NnrtError, Payload, PayloadView, Result};
use rayon::prelude::*;

/// Outputs shorter than this are computed on the calling thread.
const PAR_MIN_LEN: usize = 4096;

/// Per-element body: `(output index, positional args) -> value`.
pub type ElementFn = dyn Fn(usize, &[&[f32]]) -> f32 + Send + Sync;

/// Whole-buffer body: fills the output from positional args.
pub type BlockFn = dyn Fn(&[&[f32]], &mut [f32]) + Send + Sync;

#[derive(Clone)]
enum Body {
    Element(Arc<ElementFn>),
    Block(Arc<BlockFn>),
}

/// Builds kernels against one device context.
///
/// `pipeline` decides where dispatch results land: on the device (kept
/// resident for the next kernel) or back on the host after every dispatch.
#[derive(Debug, Clone)]
pub struct Compiler {
    ctx: DeviceContext,
    pipeline: bool,
}

impl Compiler {
    pub fn new(ctx: DeviceContext, pipeline: bool) -> Self {
        Self { ctx, pipeline }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    /// Compile a per-element kernel producing `output_len` values.
    pub fn element<F>(&self, name: &str, output_len: usize, body: F) -> Kernel
    where
        F: Fn(usize, &[&[f32]]) -> f32 + Send + Sync + 'static,
    {
        self.compile(name, output_len, Body::Element(Arc::new(body)))
    }

    /// Compile a kernel that fills its whole output in one call.
    pub fn block<F>(&self, name: &str, output_len: usize, body: F) -> Kernel
    where
        F: Fn(&[&[f32]], &mut [f32]) + Send + Sync + 'static,
    {
        self.compile(name, output_len, Body::Block(Arc::new(body)))
    }

    fn compile(&self, name: &str, output_len: usize, body: Body) -> Kernel {
        Kernel {
            ctx: self.ctx.clone(),
            name: name.to_string(),
            body,
            output_len,
            pipeline: self.pipeline,
            arg_lens: None,
        }
    }
}

/// A compiled kernel. Cloning shares the compiled body.
#[derive(Clone)]
pub struct Kernel {
    ctx: DeviceContext,
    name: String,
    body: Body,
    output_len: usize,
    pipeline: bool,
    arg_lens: Option<Vec<usize>>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Override where results land for this kernel only.
    pub fn with_pipeline(mut self, pipeline: bool) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Declare the expected element count of each positional argument.
    /// Dispatch checks arguments against it before running the body.
    pub fn with_arg_lens(mut self, lens: &[usize]) -> Self {
        self.arg_lens = Some(lens.to_vec());
        self
    }

    /// Run the kernel. Fails with `IllegalState` once the context is
    /// released.
    pub fn dispatch(&self, args: &[&Payload]) -> Result<Payload> {
        self.ctx.ensure_live()?;
        if let Some(lens) = &self.arg_lens {
            if lens.len() != args.len() {
                return Err(NnrtError::InvariantViolation(format!(
                    "kernel {} expects {} arguments, got {}",
                    self.name,
                    lens.len(),
                    args.len()
                )));
            }
            for (i, (arg, &len)) in args.iter().zip(lens).enumerate() {
                if arg.len() != len {
                    return Err(NnrtError::size_mismatch(
                        format!("kernel {} argument {i}", self.name),
                        &[len],
                        arg.len(),
                    ));
                }
            }
        }

        let views = args
            .iter()
            .map(|arg| arg.view())
            .collect::<Result<Vec<PayloadView<'_>>>>()?;
        let slices: Vec<&[f32]> = views.iter().map(|v| &**v).collect();

        let mut out = vec![0.0f32; self.output_len];
        match &self.body {
            Body::Element(body) => {
                let slices = slices.as_slice();
                out.par_iter_mut()
                    .with_min_len(PAR_MIN_LEN)
                    .enumerate()
                    .for_each(|(i, o)| *o = body(i, slices));
            }
            Body::Block(body) => body(&slices, &mut out),
        }

        tracing::trace!(
            kernel = %self.name,
            len = self.output_len,
            device = self.pipeline,
            "dispatch"
        );

        if self.pipeline {
            Ok(Payload::Device(self.ctx.adopt(out)?))
        } else {
            Ok(Payload::Host(out))
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.body {
            Body::Element(_) => "element",
            Body::Block(_) => "block",
        };
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("output_len", &self.output_len)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
