//! Graph arena: every variable and function of a session, addressed by id.
//!
//! Networks and executors hold ids into the arena instead of references, so
//! the graph carries no lifetimes and teardown is a single `clear`.

use nnrt_core::{DeviceContext, FuncId, NnrtError, Payload, Result, VariableKind};

use crate::function::Function;
use crate::variable_manager::VariableManager;

#[derive(Debug, Default)]
pub struct GraphArena {
    pub(crate) variables: VariableManager,
    functions: Vec<Function>,
}

impl GraphArena {
    pub fn new(variables: VariableManager) -> Self {
        Self {
            variables,
            functions: Vec::new(),
        }
    }

    pub fn variables(&self) -> &VariableManager {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableManager {
        &mut self.variables
    }

    /// Id the next pushed function will receive.
    pub fn next_function_id(&self) -> FuncId {
        FuncId(self.functions.len())
    }

    pub fn push_function(&mut self, function: Function) -> FuncId {
        let id = function.id;
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FuncId) -> Result<&Function> {
        self.functions
            .get(id.0)
            .ok_or_else(|| NnrtError::InvariantViolation(format!("dangling function id {id}")))
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Run one function against the current payloads of its inputs and store
    /// the results in its outputs.
    ///
    /// With a context, parameter inputs the operator treats as constant are
    /// cached on the device first.
    pub fn forward_function(&mut self, id: FuncId, cache: Option<&DeviceContext>) -> Result<()> {
        let function = self
            .functions
            .get_mut(id.0)
            .ok_or_else(|| NnrtError::InvariantViolation(format!("dangling function id {id}")))?;
        let variables = &mut self.variables;

        if let Some(ctx) = cache {
            for &pos in function.operator.constant_inputs() {
                let Some(&vid) = function.inputs.get(pos) else {
                    continue;
                };
                let var = variables.get_mut(vid)?;
                if var.kind() == VariableKind::Parameter {
                    var.cache(ctx)?;
                }
            }
        }

        let results = {
            let inputs = function
                .inputs
                .iter()
                .map(|&vid| variables.get(vid).map(|v| v.payload()))
                .collect::<Result<Vec<&Payload>>>()?;
            function.operator.forward(&inputs)?
        };

        if results.len() != function.outputs.len() {
            return Err(NnrtError::InvariantViolation(format!(
                "{} returned {} outputs, expected {}",
                function.name,
                results.len(),
                function.outputs.len()
            )));
        }
        for (&vid, payload) in function.outputs.iter().zip(results) {
            variables.get_mut(vid)?.set_payload(payload)?;
        }
        function.forward_count += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.variables.clear();
    }
}
