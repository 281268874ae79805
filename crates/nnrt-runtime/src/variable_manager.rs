//! Name-keyed registry of variables shared by every network in a session.

use std::collections::HashMap;

use nnrt_core::{EntityKind, NnrtError, Result, Shape, VarId, Variable};

use crate::desc::ParameterRecord;

/// Owns every variable of a session. Ids are dense indices and stay valid
/// until `clear`.
#[derive(Debug, Default)]
pub struct VariableManager {
    variables: Vec<Variable>,
    index: HashMap<String, VarId>,
}

impl VariableManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one parameter variable per persisted record.
    pub fn from_parameters(records: Vec<ParameterRecord>) -> Result<Self> {
        let mut manager = Self::new();
        for record in records {
            let var = Variable::parameter(record.name, Shape::from(record.shape), record.values)?;
            manager.register(var)?;
        }
        Ok(manager)
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn id(&self, name: &str) -> Result<VarId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| NnrtError::not_found(EntityKind::Variable, name))
    }

    /// Ids are only handed out by this manager, so an out-of-range id is a
    /// broken invariant rather than a lookup miss.
    pub fn get(&self, id: VarId) -> Result<&Variable> {
        self.variables
            .get(id.0)
            .ok_or_else(|| NnrtError::InvariantViolation(format!("dangling variable id {id}")))
    }

    pub fn get_mut(&mut self, id: VarId) -> Result<&mut Variable> {
        self.variables
            .get_mut(id.0)
            .ok_or_else(|| NnrtError::InvariantViolation(format!("dangling variable id {id}")))
    }

    pub fn by_name(&self, name: &str) -> Result<&Variable> {
        self.get(self.id(name)?)
    }

    /// Add a variable under its own name. Names are unique.
    pub fn register(&mut self, var: Variable) -> Result<VarId> {
        if self.index.contains_key(var.name()) {
            return Err(NnrtError::InvariantViolation(format!(
                "variable {} is already registered",
                var.name()
            )));
        }
        let id = VarId(self.variables.len());
        self.index.insert(var.name().to_string(), id);
        self.variables.push(var);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.variables.iter().enumerate().map(|(i, v)| (VarId(i), v))
    }

    pub fn clear(&mut self) {
        self.variables.clear();
        self.index.clear();
    }
}
