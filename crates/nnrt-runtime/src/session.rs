//! Host-facing session: owns the graph, the executors and the device context.

use std::collections::{BTreeMap, HashMap};

use nnrt_core::{DeviceContext, EntityKind, NnrtError, Result, Variable};
use nnrt_kernels::{Compiler, SimdCapability};

use crate::arena::GraphArena;
use crate::config::SessionConfig;
use crate::desc::{ModelDescription, ParameterRecord};
use crate::executor::{Executor, ForwardOptions};
use crate::format::Container;
use crate::function::Function;
use crate::network::Network;
use crate::variable_manager::VariableManager;

/// A loaded model ready for forward calls.
///
/// Every network of the model shares one variable registry, so buffers
/// declared under the same name in two networks are the same variable.
/// `forward` takes `&mut self`: calls against one session never overlap.
#[derive(Debug)]
pub struct Session {
    arena: GraphArena,
    networks: BTreeMap<String, Network>,
    executors: BTreeMap<String, Executor>,
    compiler: Compiler,
    owns_context: bool,
    config: SessionConfig,
    released: bool,
}

impl Session {
    /// Build every network and executor of `desc`.
    ///
    /// Without a context the session creates its own and releases it with
    /// the session; a caller-supplied context outlives it.
    pub fn new(
        desc: &ModelDescription,
        parameters: Vec<ParameterRecord>,
        ctx: Option<DeviceContext>,
        config: SessionConfig,
    ) -> Result<Self> {
        let (ctx, owns_context) = match ctx {
            Some(ctx) => (ctx, false),
            None => (DeviceContext::new(), true),
        };
        ctx.ensure_live()?;

        let parameter_count = parameters.len();
        let compiler = Compiler::new(ctx, config.pipeline);
        let mut arena = GraphArena::new(VariableManager::from_parameters(parameters)?);

        let mut networks = BTreeMap::new();
        for net in &desc.networks {
            if networks.contains_key(&net.name) {
                return Err(NnrtError::InvariantViolation(format!(
                    "network {} is declared twice",
                    net.name
                )));
            }
            let network = Network::build(net, &mut arena, &compiler)?;
            networks.insert(net.name.clone(), network);
        }

        let mut executors = BTreeMap::new();
        for exec in &desc.executors {
            if executors.contains_key(&exec.name) {
                return Err(NnrtError::InvariantViolation(format!(
                    "executor {} is declared twice",
                    exec.name
                )));
            }
            let network = networks
                .get(&exec.network)
                .ok_or_else(|| NnrtError::not_found(EntityKind::Network, &exec.network))?;
            executors.insert(exec.name.clone(), Executor::new(exec, network)?);
        }

        tracing::info!(
            networks = networks.len(),
            executors = executors.len(),
            parameters = parameter_count,
            functions = arena.function_count(),
            simd = SimdCapability::detect().best_tier(),
            pipeline = config.pipeline,
            "session created"
        );

        Ok(Self {
            arena,
            networks,
            executors,
            compiler,
            owns_context,
            config,
            released: false,
        })
    }

    /// Build a session from `.nnrt` container bytes.
    pub fn from_bytes(bytes: &[u8], ctx: Option<DeviceContext>, config: SessionConfig) -> Result<Self> {
        let container = Container::from_bytes(bytes)?;
        let parameters = container.parameters()?;
        Self::new(&container.description(), parameters, ctx, config)
    }

    /// Asynchronous `from_bytes`. Yields to the runtime once, then builds on
    /// the calling task.
    pub async fn load(bytes: &[u8], ctx: Option<DeviceContext>, config: SessionConfig) -> Result<Self> {
        tokio::task::yield_now().await;
        Self::from_bytes(bytes, ctx, config)
    }

    /// Run an executor. Returns its outputs on the host, keyed by name.
    pub fn forward(
        &mut self,
        executor: &str,
        inputs: &HashMap<String, Vec<f32>>,
        options: ForwardOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        self.ensure_live()?;
        let exec = self
            .executors
            .get(executor)
            .ok_or_else(|| NnrtError::not_found(EntityKind::Executor, executor))?;
        let network = self
            .networks
            .get(exec.network())
            .ok_or_else(|| NnrtError::not_found(EntityKind::Network, exec.network()))?;
        let cache = self.config.cache_parameters.then(|| self.compiler.context());
        exec.forward(network, &mut self.arena, inputs, options, cache)
    }

    /// Asynchronous `forward`; errors surface through the returned future.
    pub async fn forward_async(
        &mut self,
        executor: &str,
        inputs: &HashMap<String, Vec<f32>>,
        options: ForwardOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        tokio::task::yield_now().await;
        self.forward(executor, inputs, options)
    }

    /// Tear down the graph. An owned context is released too. Irreversible:
    /// every later call fails with `IllegalState`.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.released = true;
        self.arena.clear();
        self.networks.clear();
        self.executors.clear();
        if self.owns_context {
            self.compiler.context().release()?;
        }
        tracing::info!(owned_context = self.owns_context, "session released");
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(NnrtError::IllegalState("session has been released".into()));
        }
        Ok(())
    }

    pub fn executor_names(&self) -> Result<Vec<&str>> {
        self.ensure_live()?;
        Ok(self.executors.keys().map(String::as_str).collect())
    }

    pub fn network_names(&self) -> Result<Vec<&str>> {
        self.ensure_live()?;
        Ok(self.networks.keys().map(String::as_str).collect())
    }

    pub fn network(&self, name: &str) -> Result<&Network> {
        self.ensure_live()?;
        self.networks
            .get(name)
            .ok_or_else(|| NnrtError::not_found(EntityKind::Network, name))
    }

    pub fn executor(&self, name: &str) -> Result<&Executor> {
        self.ensure_live()?;
        self.executors
            .get(name)
            .ok_or_else(|| NnrtError::not_found(EntityKind::Executor, name))
    }

    pub fn variable(&self, network: &str, name: &str) -> Result<&Variable> {
        let id = self.network(network)?.variable_id(name)?;
        self.arena.variables().get(id)
    }

    pub fn function(&self, network: &str, name: &str) -> Result<&Function> {
        let id = self.network(network)?.function_id(name)?;
        self.arena.function(id)
    }

    pub fn context(&self) -> &DeviceContext {
        self.compiler.context()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// One-line summary for logs.
    pub fn info(&self) -> String {
        format!(
            "networks={} executors={} variables={} functions={} pipeline={} simd={}",
            self.networks.len(),
            self.executors.len(),
            self.arena.variables().len(),
            self.arena.function_count(),
            self.config.pipeline,
            SimdCapability::detect().best_tier(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{ExecutorDesc, FunctionDesc, NetworkDesc, VariableDesc};

    fn relu_model() -> ModelDescription {
        ModelDescription {
            version: "1".into(),
            networks: vec![NetworkDesc {
                name: "main".into(),
                variables: vec![VariableDesc::buffer("x", &[3]), VariableDesc::buffer("y", &[3])],
                functions: vec![FunctionDesc::new("relu", "ReLU", &["x"], &["y"])],
            }],
            executors: vec![ExecutorDesc::new("run", "main", &["x"], &["y"])],
        }
    }

    #[test]
    fn test_forward() {
        let mut session = Session::new(&relu_model(), vec![], None, SessionConfig::default()).unwrap();
        let inputs = HashMap::from([("x".to_string(), vec![-1.0, 0.5, 2.0])]);
        let out = session.forward("run", &inputs, ForwardOptions::default()).unwrap();
        assert_eq!(out["y"], vec![0.0, 0.5, 2.0]);
        assert_eq!(session.executor_names().unwrap(), vec!["run"]);
        assert!(session.info().contains("functions=1"));
    }

    #[test]
    fn test_unknown_executor() {
        let mut session = Session::new(&relu_model(), vec![], None, SessionConfig::default()).unwrap();
        let err = session
            .forward("missing", &HashMap::new(), ForwardOptions::default())
            .unwrap_err();
        assert!(matches!(err, NnrtError::NotFound { kind: EntityKind::Executor, .. }));
    }

    #[test]
    fn test_executor_on_unknown_network() {
        let mut desc = relu_model();
        desc.executors[0].network = "other".into();
        let err = Session::new(&desc, vec![], None, SessionConfig::default()).unwrap_err();
        assert!(matches!(err, NnrtError::NotFound { kind: EntityKind::Network, .. }));
    }

    #[test]
    fn test_release_twice() {
        let mut session = Session::new(&relu_model(), vec![], None, SessionConfig::default()).unwrap();
        session.release().unwrap();
        assert!(session.is_released());
        assert!(matches!(session.release(), Err(NnrtError::IllegalState(_))));
        assert!(matches!(session.network("main"), Err(NnrtError::IllegalState(_))));
    }

    #[test]
    fn test_released_context_rejected() {
        let ctx = DeviceContext::new();
        ctx.release().unwrap();
        let err = Session::new(&relu_model(), vec![], Some(ctx), SessionConfig::default()).unwrap_err();
        assert!(matches!(err, NnrtError::IllegalState(_)));
    }
}
