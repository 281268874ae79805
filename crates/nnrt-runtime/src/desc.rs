//! Parsed graph descriptions: the input the graph builder consumes.
//!
//! These mirror the shape of a model file's text graph: per network, the
//! declared variables and functions; per executor, the owning network and
//! its input/output names.

use nnrt_core::{NnrtError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Buffer,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableType,
    /// Declared dimensions; `-1` marks the batch placeholder.
    pub shape: Vec<i64>,
}

impl VariableDesc {
    pub fn buffer(name: impl Into<String>, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            kind: VariableType::Buffer,
            shape: shape.to_vec(),
        }
    }

    pub fn parameter(name: impl Into<String>, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            kind: VariableType::Parameter,
            shape: shape.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDesc {
    pub name: String,
    /// Operator kind, e.g. `"Convolution"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attrs: Value,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl FunctionDesc {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            attrs: Value::Null,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_attrs(mut self, attrs: Value) -> Self {
        self.attrs = attrs;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDesc {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<VariableDesc>,
    #[serde(default)]
    pub functions: Vec<FunctionDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDesc {
    pub name: String,
    pub network: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl ExecutorDesc {
    pub fn new(name: impl Into<String>, network: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Every network and executor in one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub networks: Vec<NetworkDesc>,
    #[serde(default)]
    pub executors: Vec<ExecutorDesc>,
}

impl ModelDescription {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| NnrtError::Format(format!("model description: {e}")))
    }
}

/// One persisted tensor: name, shape and flat values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParameterRecord {
    pub fn new(name: impl Into<String>, shape: &[usize], values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description() {
        let json = r#"{
            "version": "0.1",
            "networks": [{
                "name": "main",
                "variables": [
                    { "name": "x", "type": "Buffer", "shape": [-1, 4] },
                    { "name": "w", "type": "Parameter", "shape": [4, 2] }
                ],
                "functions": [{
                    "name": "fc",
                    "type": "Affine",
                    "attrs": { "base_axis": 1 },
                    "inputs": ["x", "w"],
                    "outputs": ["y"]
                }]
            }],
            "executors": [{ "name": "run", "network": "main", "inputs": ["x"], "outputs": ["y"] }]
        }"#;
        let desc = ModelDescription::from_json(json).unwrap();
        assert_eq!(desc.networks[0].variables[0], VariableDesc::buffer("x", &[-1, 4]));
        assert_eq!(desc.networks[0].variables[1].kind, VariableType::Parameter);
        assert_eq!(desc.networks[0].functions[0].kind, "Affine");
        assert_eq!(desc.executors[0].network, "main");
    }

    #[test]
    fn test_missing_attrs_is_null() {
        let f: FunctionDesc = serde_json::from_str(
            r#"{ "name": "r", "type": "ReLU", "inputs": ["x"], "outputs": ["y"] }"#,
        )
        .unwrap();
        assert!(f.attrs.is_null());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(ModelDescription::from_json("{"), Err(NnrtError::Format(_))));
    }
}
