//! Network construction from a parsed graph description.

use std::collections::BTreeMap;

use nnrt_core::{EntityKind, FuncId, NnrtError, Result, Shape, VarId, Variable};
use nnrt_kernels::Compiler;
use nnrt_ops::Operator;

use crate::arena::GraphArena;
use crate::desc::{FunctionDesc, NetworkDesc, VariableType};
use crate::function::Function;

/// A named DAG of variables and functions living in a [`GraphArena`].
///
/// Topology is fixed once `build` returns.
#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    variables: BTreeMap<String, VarId>,
    functions: BTreeMap<String, FuncId>,
    order: Vec<FuncId>,
}

impl Network {
    /// Allocate the network's buffers, check its parameters are loaded, and
    /// set up every function in declaration order.
    pub fn build(desc: &NetworkDesc, arena: &mut GraphArena, compiler: &Compiler) -> Result<Self> {
        let mut network = Self {
            name: desc.name.clone(),
            variables: BTreeMap::new(),
            functions: BTreeMap::new(),
            order: Vec::with_capacity(desc.functions.len()),
        };

        for var in &desc.variables {
            let id = match var.kind {
                VariableType::Buffer => match arena.variables().id(&var.name) {
                    Ok(id) => id,
                    Err(_) => {
                        let shape = Shape::from_declared(&var.shape).ok_or_else(|| {
                            NnrtError::Format(format!(
                                "network {}: variable {} declares a zero dimension in {:?}",
                                desc.name, var.name, var.shape
                            ))
                        })?;
                        arena.variables_mut().register(Variable::buffer(&var.name, shape))?
                    }
                },
                VariableType::Parameter => arena.variables().id(&var.name).map_err(|_| {
                    NnrtError::InvariantViolation(format!(
                        "network {}: parameter {} has no persisted values",
                        desc.name, var.name
                    ))
                })?,
            };
            network.variables.insert(var.name.clone(), id);
        }

        for func in &desc.functions {
            let id = network.add_function(func, arena, compiler)?;
            network.order.push(id);
        }

        tracing::debug!(
            network = %network.name,
            variables = network.variables.len(),
            functions = network.functions.len(),
            "network built"
        );
        Ok(network)
    }

    fn add_function(&mut self, desc: &FunctionDesc, arena: &mut GraphArena, compiler: &Compiler) -> Result<FuncId> {
        if self.functions.contains_key(&desc.name) {
            return Err(NnrtError::InvariantViolation(format!(
                "network {}: function {} is declared twice",
                self.name, desc.name
            )));
        }

        let inputs = self.resolve(&desc.inputs, arena)?;
        let outputs = self.resolve(&desc.outputs, arena)?;
        let operator = Operator::from_descriptor(&desc.name, &desc.kind, &desc.attrs)?;

        let shapes = |ids: &[VarId]| -> Result<Vec<Shape>> {
            ids.iter()
                .map(|&id| arena.variables().get(id).map(|v| v.shape().clone()))
                .collect()
        };
        let input_shapes = shapes(&inputs)?;
        let output_shapes = shapes(&outputs)?;

        let id = arena.next_function_id();
        let mut function = Function::new(id, &desc.name, operator, inputs, outputs);
        function.setup(compiler, &input_shapes, &output_shapes)?;

        for &out in function.outputs() {
            arena.variables_mut().get_mut(out)?.set_producer(id)?;
        }
        arena.push_function(function);
        self.functions.insert(desc.name.clone(), id);
        Ok(id)
    }

    /// Names resolve through the shared manager, so functions may refer to
    /// variables declared by another network of the same session.
    fn resolve(&mut self, names: &[String], arena: &GraphArena) -> Result<Vec<VarId>> {
        names
            .iter()
            .map(|name| {
                let id = arena.variables().id(name)?;
                self.variables.entry(name.clone()).or_insert(id);
                Ok(id)
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variable_id(&self, name: &str) -> Result<VarId> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| NnrtError::not_found(EntityKind::Variable, name))
    }

    pub fn function_id(&self, name: &str) -> Result<FuncId> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| NnrtError::not_found(EntityKind::Function, name))
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Functions in declaration order.
    pub fn functions(&self) -> &[FuncId] {
        &self.order
    }
}
