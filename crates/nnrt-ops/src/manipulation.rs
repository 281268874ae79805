//! Index-remapping operators. Every kernel here is a gather: each output
//! element reads exactly one input element at a precomputed offset.

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::{Compiler, Kernel};
use serde::Deserialize;
use smallvec::SmallVec;

use crate::operator::{check_inputs, not_setup, Op};

fn resolve_axis(kind: &str, x: &Shape, axis: i64) -> Result<usize> {
    x.resolve_axis(axis).ok_or_else(|| NnrtError::InvalidAttribute {
        function: kind.to_string(),
        message: format!("axis {axis} out of range for {x}"),
    })
}

/// The strided gathers index by the inferred output dims.
fn check_declared(kind: &str, inferred: &Shape, outputs: &[Shape]) -> Result<()> {
    match outputs.first() {
        Some(declared) if declared == inferred => Ok(()),
        declared => Err(NnrtError::ShapeMismatch {
            context: format!("{kind} output"),
            expected: inferred.to_vec(),
            got: declared.map(Shape::to_vec).unwrap_or_default(),
        }),
    }
}

// ============================================================================
// Concatenate
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ConcatenateParam {
    /// Defaults to the last axis.
    pub axis: Option<i64>,
}

/// Join inputs along one axis; every other dimension must agree.
#[derive(Debug)]
pub struct Concatenate {
    param: ConcatenateParam,
    kernel: Option<Kernel>,
}

impl Concatenate {
    pub fn new(param: ConcatenateParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn axis(&self, x: &Shape) -> Result<usize> {
        resolve_axis(self.kind(), x, self.param.axis.unwrap_or(-1))
    }
}

impl Op for Concatenate {
    fn kind(&self) -> &'static str {
        "Concatenate"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, usize::MAX)?;
        let first = &inputs[0];
        let axis = self.axis(first)?;
        let mut dims = first.to_vec();
        for x in &inputs[1..] {
            let agrees = x.ndim() == first.ndim()
                && x.dims().iter().zip(first.dims()).enumerate().all(|(i, (a, b))| i == axis || a == b);
            if !agrees {
                return Err(NnrtError::ShapeMismatch {
                    context: "Concatenate operands".into(),
                    expected: first.to_vec(),
                    got: x.to_vec(),
                });
            }
            dims[axis] += x.dims()[axis];
        }
        Ok(vec![Shape::from(dims)])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let axis = self.axis(&inputs[0])?;
        let inner = inputs[0].inner_size(axis);
        let extents: SmallVec<[usize; 4]> = inputs.iter().map(|x| x.dims()[axis]).collect();
        let total: usize = extents.iter().sum();
        let arg_lens: Vec<usize> = inputs.iter().map(Shape::numel).collect();

        let kernel = compiler
            .element("concatenate", outputs[0].numel(), move |i, args| {
                let outer = i / (total * inner);
                let mut a = (i / inner) % total;
                let rest = i % inner;
                for (j, &extent) in extents.iter().enumerate() {
                    if a < extent {
                        return args[j][(outer * extent + a) * inner + rest];
                    }
                    a -= extent;
                }
                0.0
            })
            .with_arg_lens(&arg_lens);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(inputs)?])
    }
}

// ============================================================================
// Split
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SplitParam {
    pub axis: i64,
}

/// One output per index along `axis`, each with that axis removed.
#[derive(Debug)]
pub struct Split {
    param: SplitParam,
    kernels: Vec<Kernel>,
}

impl Split {
    pub fn new(param: SplitParam) -> Self {
        Self {
            param,
            kernels: Vec::new(),
        }
    }
}

impl Op for Split {
    fn kind(&self) -> &'static str {
        "Split"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let x = &inputs[0];
        let axis = resolve_axis(self.kind(), x, self.param.axis)?;
        Ok(vec![x.without_axis(axis); x.dims()[axis]])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        let axis = resolve_axis(self.kind(), x, self.param.axis)?;
        let extent = x.dims()[axis];
        let inner = x.inner_size(axis);
        let n = x.numel();

        self.kernels = outputs
            .iter()
            .enumerate()
            .map(|(index, out)| {
                compiler
                    .element("split", out.numel(), move |i, args| {
                        args[0][((i / inner) * extent + index) * inner + i % inner]
                    })
                    .with_arg_lens(&[n])
            })
            .collect();
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        if self.kernels.is_empty() {
            return Err(not_setup(self.kind()));
        }
        self.kernels.iter().map(|k| k.dispatch(&[inputs[0]])).collect()
    }
}

// ============================================================================
// Slice
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SliceParam {
    pub start: Vec<i64>,
    pub stop: Vec<i64>,
    pub step: Vec<i64>,
}

/// Per-axis `start..stop` with a positive `step`. `stop` is clamped to the
/// axis extent.
#[derive(Debug)]
pub struct Slice {
    param: SliceParam,
    kernel: Option<Kernel>,
}

/// Per-axis `(start, step, extent)` in elements.
type SliceAxes = SmallVec<[(usize, usize, usize); 4]>;

impl Slice {
    pub fn new(param: SliceParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn axes(&self, x: &Shape) -> Result<SliceAxes> {
        let SliceParam { start, stop, step } = &self.param;
        if start.len() != x.ndim() || stop.len() != x.ndim() || step.len() != x.ndim() {
            return Err(NnrtError::InvalidAttribute {
                function: self.kind().to_string(),
                message: format!(
                    "start/stop/step need {} entries, got {}/{}/{}",
                    x.ndim(),
                    start.len(),
                    stop.len(),
                    step.len()
                ),
            });
        }
        let mut axes = SliceAxes::new();
        for (i, &dim) in x.dims().iter().enumerate() {
            if start[i] < 0 || stop[i] < 0 {
                return Err(NnrtError::Unsupported(format!(
                    "Slice: negative index on axis {i} ({}..{})",
                    start[i], stop[i]
                )));
            }
            if step[i] <= 0 {
                return Err(NnrtError::InvalidAttribute {
                    function: self.kind().to_string(),
                    message: format!("step must be positive, got {} on axis {i}", step[i]),
                });
            }
            let (begin, end, stride) = (start[i] as usize, (stop[i] as usize).min(dim), step[i] as usize);
            let extent = if end > begin { (end - begin).div_ceil(stride) } else { 0 };
            axes.push((begin, stride, extent));
        }
        Ok(axes)
    }
}

impl Op for Slice {
    fn kind(&self) -> &'static str {
        "Slice"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let axes = self.axes(&inputs[0])?;
        Ok(vec![axes.iter().map(|&(_, _, extent)| extent).collect::<Vec<_>>().into()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        let axes = self.axes(x)?;
        let out = Shape::from(axes.iter().map(|&(_, _, extent)| extent).collect::<Vec<_>>());
        check_declared(self.kind(), &out, outputs)?;
        let in_strides = x.contiguous_strides();
        let out_strides = out.contiguous_strides();

        let kernel = compiler
            .element("slice", out.numel(), move |i, args| {
                let mut rest = i;
                let mut src = 0;
                for (d, &(begin, step, _)) in axes.iter().enumerate() {
                    let loc = rest / out_strides[d];
                    rest %= out_strides[d];
                    src += (begin + loc * step) * in_strides[d];
                }
                args[0][src]
            })
            .with_arg_lens(&[x.numel()]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}

// ============================================================================
// Transpose
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransposeParam {
    pub axes: Vec<usize>,
}

/// Axis permutation: output axis `i` is input axis `axes[i]`.
#[derive(Debug)]
pub struct Transpose {
    param: TransposeParam,
    kernel: Option<Kernel>,
}

impl Transpose {
    pub fn new(param: TransposeParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn check_permutation(&self, x: &Shape) -> Result<()> {
        let axes = &self.param.axes;
        let mut seen = vec![false; x.ndim()];
        let valid = axes.len() == x.ndim()
            && axes.iter().all(|&a| a < seen.len() && !std::mem::replace(&mut seen[a], true));
        if !valid {
            return Err(NnrtError::InvalidAttribute {
                function: self.kind().to_string(),
                message: format!("axes {axes:?} is not a permutation of {} axes", x.ndim()),
            });
        }
        Ok(())
    }
}

impl Op for Transpose {
    fn kind(&self) -> &'static str {
        "Transpose"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let x = &inputs[0];
        self.check_permutation(x)?;
        Ok(vec![self.param.axes.iter().map(|&a| x.dims()[a]).collect::<Vec<_>>().into()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        self.check_permutation(x)?;
        let in_strides = x.contiguous_strides();
        // stride in the input of a unit step along each output axis
        let gather: SmallVec<[usize; 4]> = self.param.axes.iter().map(|&a| in_strides[a]).collect();
        let out = Shape::from(self.param.axes.iter().map(|&a| x.dims()[a]).collect::<Vec<_>>());
        check_declared(self.kind(), &out, outputs)?;
        let out_strides = out.contiguous_strides();

        let kernel = compiler
            .element("transpose", out.numel(), move |i, args| {
                let mut rest = i;
                let mut src = 0;
                for (d, &stride) in out_strides.iter().enumerate() {
                    src += (rest / stride) * gather[d];
                    rest %= stride;
                }
                args[0][src]
            })
            .with_arg_lens(&[x.numel()]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}

// ============================================================================
// Reshape
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReshapeParam {
    /// Target dimensions; one entry may be `-1`.
    pub shape: Vec<i64>,
}

/// Size-preserving reinterpretation; the data is copied unchanged.
#[derive(Debug)]
pub struct Reshape {
    param: ReshapeParam,
    kernel: Option<Kernel>,
}

impl Reshape {
    pub fn new(param: ReshapeParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }
}

impl Op for Reshape {
    fn kind(&self) -> &'static str {
        "Reshape"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let x = &inputs[0];
        let shape = x.resolve_reshape(&self.param.shape).ok_or_else(|| NnrtError::ShapeMismatch {
            context: format!("Reshape target {:?}", self.param.shape),
            expected: x.to_vec(),
            got: self.param.shape.iter().map(|&d| d.max(0) as usize).collect(),
        })?;
        Ok(vec![shape])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let n = inputs[0].numel();
        let kernel = compiler
            .block("reshape", n, |args, out| out.copy_from_slice(args[0]))
            .with_arg_lens(&[n]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}
