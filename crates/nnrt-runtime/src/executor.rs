//! Lazy forward evaluation over a network.

use std::collections::HashMap;

use nnrt_core::{DeviceContext, FuncId, NnrtError, Result, VarId};

use crate::arena::GraphArena;
use crate::desc::ExecutorDesc;
use crate::network::Network;

/// Number of leading values shown per variable in verbose mode.
const PREVIEW_LEN: usize = 8;

/// Per-call switches for a forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Log every evaluated variable with its shape and leading values.
    pub verbose: bool,
}

impl ForwardOptions {
    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

enum Step {
    Enter(VarId),
    Exit(FuncId),
}

/// A named entry point into a network: the variables callers write and the
/// variables they read back.
#[derive(Debug, Clone)]
pub struct Executor {
    name: String,
    network: String,
    inputs: Vec<(String, VarId)>,
    outputs: Vec<(String, VarId)>,
}

impl Executor {
    pub fn new(desc: &ExecutorDesc, network: &Network) -> Result<Self> {
        let resolve = |names: &[String]| -> Result<Vec<(String, VarId)>> {
            names
                .iter()
                .map(|name| Ok((name.clone(), network.variable_id(name)?)))
                .collect()
        };
        Ok(Self {
            name: desc.name.clone(),
            network: network.name().to_string(),
            inputs: resolve(&desc.inputs)?,
            outputs: resolve(&desc.outputs)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }

    /// Write `inputs`, evaluate only what the declared outputs depend on,
    /// and return every output on the host.
    ///
    /// All inputs are validated before any is written. Each function runs at
    /// most once per call.
    pub fn forward(
        &self,
        network: &Network,
        arena: &mut GraphArena,
        inputs: &HashMap<String, Vec<f32>>,
        options: ForwardOptions,
        cache: Option<&DeviceContext>,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut writes = Vec::with_capacity(inputs.len());
        for (name, values) in inputs {
            let id = network.variable_id(name)?;
            let var = arena.variables().get(id)?;
            if values.len() != var.size() {
                return Err(NnrtError::size_mismatch(name, var.shape().dims(), values.len()));
            }
            writes.push((id, values));
        }
        for (id, values) in writes {
            arena.variables_mut().get_mut(id)?.set_data(values.clone())?;
        }

        let evaluated = self.evaluate(arena, options, cache)?;
        tracing::debug!(executor = %self.name, functions = evaluated, "forward");

        self.outputs
            .iter()
            .map(|(name, id)| Ok((name.clone(), arena.variables().get(*id)?.to_host()?)))
            .collect()
    }

    /// Post-order walk from the outputs. Returns the number of functions run.
    fn evaluate(&self, arena: &mut GraphArena, options: ForwardOptions, cache: Option<&DeviceContext>) -> Result<usize> {
        let mut marks: HashMap<FuncId, Mark> = HashMap::new();
        let mut stack: Vec<Step> = self.outputs.iter().rev().map(|&(_, id)| Step::Enter(id)).collect();
        let mut evaluated = 0;

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(var) => {
                    let Some(func) = arena.variables().get(var)?.producer() else {
                        continue;
                    };
                    match marks.get(&func) {
                        Some(Mark::Done) => {}
                        // Still pending below us on the stack: `var` feeds its own producer.
                        Some(Mark::InProgress) => {
                            let function = arena.function(func)?;
                            return Err(NnrtError::InvariantViolation(format!(
                                "dependency cycle through function {}",
                                function.name()
                            )));
                        }
                        None => {
                            marks.insert(func, Mark::InProgress);
                            stack.push(Step::Exit(func));
                            let function = arena.function(func)?;
                            stack.extend(function.inputs().iter().rev().map(|&id| Step::Enter(id)));
                        }
                    }
                }
                Step::Exit(func) => {
                    arena.forward_function(func, cache)?;
                    marks.insert(func, Mark::Done);
                    evaluated += 1;
                    if options.verbose {
                        self.log_outputs(arena, func)?;
                    }
                }
            }
        }
        Ok(evaluated)
    }

    fn log_outputs(&self, arena: &GraphArena, func: FuncId) -> Result<()> {
        let function = arena.function(func)?;
        for &id in function.outputs() {
            let var = arena.variables().get(id)?;
            let values = var.to_host()?;
            let preview = &values[..values.len().min(PREVIEW_LEN)];
            tracing::info!(
                executor = %self.name,
                function = function.name(),
                variable = var.name(),
                shape = %var.shape(),
                preview = ?preview,
                "evaluated"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{FunctionDesc, NetworkDesc, VariableDesc};
    use nnrt_core::EntityKind;
    use nnrt_kernels::Compiler;

    fn build(desc: &NetworkDesc) -> (GraphArena, Network) {
        let mut arena = GraphArena::default();
        let compiler = Compiler::new(DeviceContext::new(), true);
        let net = Network::build(desc, &mut arena, &compiler).unwrap();
        (arena, net)
    }

    fn chain() -> NetworkDesc {
        NetworkDesc {
            name: "main".into(),
            variables: vec![
                VariableDesc::buffer("x", &[4]),
                VariableDesc::buffer("y", &[4]),
                VariableDesc::buffer("z", &[4]),
                VariableDesc::buffer("unused", &[4]),
            ],
            functions: vec![
                FunctionDesc::new("relu", "ReLU", &["x"], &["y"]),
                FunctionDesc::new("double", "Add2", &["y", "y"], &["z"]),
                FunctionDesc::new("side", "Exp", &["x"], &["unused"]),
            ],
        }
    }

    fn inputs(values: &[f32]) -> HashMap<String, Vec<f32>> {
        HashMap::from([("x".to_string(), values.to_vec())])
    }

    #[test]
    fn test_forward_touches_only_needed_subgraph() {
        let (mut arena, net) = build(&chain());
        let exec = Executor::new(&ExecutorDesc::new("run", "main", &["x"], &["z"]), &net).unwrap();

        let out = exec
            .forward(&net, &mut arena, &inputs(&[-1.0, 2.0, -3.0, 4.0]), ForwardOptions::default(), None)
            .unwrap();
        assert_eq!(out["z"], vec![0.0, 4.0, 0.0, 8.0]);

        let side = arena.function(net.function_id("side").unwrap()).unwrap();
        assert_eq!(side.forward_count(), 0);
        let relu = arena.function(net.function_id("relu").unwrap()).unwrap();
        assert_eq!(relu.forward_count(), 1);
    }

    #[test]
    fn test_input_validated_before_write() {
        let (mut arena, net) = build(&chain());
        let exec = Executor::new(&ExecutorDesc::new("run", "main", &["x"], &["z"]), &net).unwrap();

        let mut bad = inputs(&[1.0, 2.0, 3.0, 4.0]);
        bad.insert("y".into(), vec![1.0; 3]);
        let err = exec
            .forward(&net, &mut arena, &bad, ForwardOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, NnrtError::ShapeMismatch { .. }));
        let x = arena.variables().get(net.variable_id("x").unwrap()).unwrap();
        assert_eq!(x.to_host().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_unknown_input_name() {
        let (mut arena, net) = build(&chain());
        let exec = Executor::new(&ExecutorDesc::new("run", "main", &["x"], &["z"]), &net).unwrap();
        let mut bad = inputs(&[0.0; 4]);
        bad.insert("ghost".into(), vec![0.0]);
        let err = exec
            .forward(&net, &mut arena, &bad, ForwardOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, NnrtError::NotFound { kind: EntityKind::Variable, .. }));
    }

    #[test]
    fn test_unknown_output_at_construction() {
        let (_, net) = build(&chain());
        let err = Executor::new(&ExecutorDesc::new("run", "main", &["x"], &["nope"]), &net).unwrap_err();
        assert!(matches!(err, NnrtError::NotFound { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let desc = NetworkDesc {
            name: "loop".into(),
            variables: vec![VariableDesc::buffer("a", &[2]), VariableDesc::buffer("b", &[2])],
            functions: vec![
                FunctionDesc::new("f", "ReLU", &["a"], &["b"]),
                FunctionDesc::new("g", "Tanh", &["b"], &["a"]),
            ],
        };
        let (mut arena, net) = build(&desc);
        let exec = Executor::new(&ExecutorDesc::new("run", "loop", &[], &["b"]), &net).unwrap();
        let err = exec
            .forward(&net, &mut arena, &HashMap::new(), ForwardOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, NnrtError::InvariantViolation(_)));
    }

    #[test]
    fn test_verbose_forward() {
        let (mut arena, net) = build(&chain());
        let exec = Executor::new(&ExecutorDesc::new("run", "main", &["x"], &["z"]), &net).unwrap();
        let out = exec
            .forward(&net, &mut arena, &inputs(&[1.0; 4]), ForwardOptions::verbose(), None)
            .unwrap();
        assert_eq!(out["z"], vec![2.0; 4]);
    }
}
