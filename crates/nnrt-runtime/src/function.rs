use nnrt_core::{FuncId, Result, Shape, VarId};
use nnrt_kernels::Compiler;
use nnrt_ops::Operator;

/// A graph node: one operator bound to ordered input and output variables.
#[derive(Debug)]
pub struct Function {
    pub(crate) id: FuncId,
    pub(crate) name: String,
    pub(crate) operator: Operator,
    pub(crate) inputs: Vec<VarId>,
    pub(crate) outputs: Vec<VarId>,
    pub(crate) setup_count: usize,
    pub(crate) forward_count: usize,
}

impl Function {
    pub fn new(id: FuncId, name: impl Into<String>, operator: Operator, inputs: Vec<VarId>, outputs: Vec<VarId>) -> Self {
        Self {
            id,
            name: name.into(),
            operator,
            inputs,
            outputs,
            setup_count: 0,
            forward_count: 0,
        }
    }

    pub fn id(&self) -> FuncId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.operator.kind()
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// Times `setup` has run. Stays at one for the life of the graph.
    pub fn setup_count(&self) -> usize {
        self.setup_count
    }

    /// Times `forward` has run, across every executor call.
    pub fn forward_count(&self) -> usize {
        self.forward_count
    }

    pub(crate) fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        self.operator.setup(compiler, inputs, outputs)?;
        self.setup_count += 1;
        tracing::debug!(
            function = %self.name,
            kind = self.kind(),
            outputs = ?outputs.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "function setup"
        );
        Ok(())
    }
}
