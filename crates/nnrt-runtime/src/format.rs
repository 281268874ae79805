//! `.nnrt` container: graph description and f32 parameters in one file.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Magic: "NNRT" (4 bytes)              │
//! │ Version: u32 LE                      │
//! │ Header size: u32 LE                  │
//! ├──────────────────────────────────────┤
//! │ Header JSON (graph, parameter index) │
//! ├──────────────────────────────────────┤
//! │ Padding to 64-byte alignment         │
//! ├──────────────────────────────────────┤
//! │ Parameter blob (f32 LE, contiguous)  │
//! └──────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use nnrt_core::NnrtError;
use serde::{Deserialize, Serialize};

use crate::desc::{ExecutorDesc, ModelDescription, NetworkDesc, ParameterRecord};

pub const MAGIC: &[u8; 4] = b"NNRT";

pub const VERSION: u32 = 1;

/// Magic, version and header size.
const PREAMBLE: usize = 12;

/// Alignment of the blob start and of every parameter within it.
const BLOB_ALIGNMENT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("data too small for the .nnrt container")]
    TooSmall,
    #[error("invalid magic bytes (expected NNRT)")]
    BadMagic,
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("parameter {0} lies outside the blob")]
    MissingData(String),
}

impl From<FormatError> for NnrtError {
    fn from(err: FormatError) -> Self {
        NnrtError::Format(err.to_string())
    }
}

/// Location of one parameter in the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub shape: Vec<usize>,
    pub offset: usize,
    pub nbytes: usize,
}

impl TensorEntry {
    /// Element count; `None` if the shape overflows `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub networks: Vec<NetworkDesc>,
    #[serde(default)]
    pub executors: Vec<ExecutorDesc>,
    #[serde(default)]
    pub parameters: BTreeMap<String, TensorEntry>,
}

/// A decoded container: header plus the raw parameter blob.
#[derive(Debug, Clone)]
pub struct Container {
    pub header: ContainerHeader,
    pub blob: Vec<u8>,
}

impl Container {
    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < PREAMBLE {
            return Err(FormatError::TooSmall);
        }
        if &data[0..4] != MAGIC {
            return Err(FormatError::BadMagic);
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let header_end = PREAMBLE + header_size;
        if data.len() < header_end {
            return Err(FormatError::TooSmall);
        }
        let header: ContainerHeader = serde_json::from_slice(&data[PREAMBLE..header_end])
            .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;

        // A container without parameters may end right after the header.
        let blob_start = align_up(header_end, BLOB_ALIGNMENT).min(data.len());
        let container = Container {
            header,
            blob: data[blob_start..].to_vec(),
        };
        container.check_entries()?;
        Ok(container)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let header_json =
            serde_json::to_vec(&self.header).map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
        let header_size = u32::try_from(header_json.len())
            .map_err(|_| FormatError::InvalidHeader("header exceeds 4 GiB".into()))?;

        let blob_start = align_up(PREAMBLE + header_json.len(), BLOB_ALIGNMENT);
        let mut buf = Vec::with_capacity(blob_start + self.blob.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&header_json);
        buf.resize(blob_start, 0);
        buf.extend_from_slice(&self.blob);
        Ok(buf)
    }

    fn check_entries(&self) -> Result<(), FormatError> {
        for (name, entry) in &self.header.parameters {
            let in_bounds = entry
                .offset
                .checked_add(entry.nbytes)
                .is_some_and(|end| end <= self.blob.len());
            let Some(nbytes) = entry.numel().and_then(|n| n.checked_mul(std::mem::size_of::<f32>())) else {
                return Err(FormatError::InvalidHeader(format!(
                    "parameter {name}: shape {:?} overflows",
                    entry.shape
                )));
            };
            if !in_bounds || entry.nbytes != nbytes {
                return Err(FormatError::MissingData(name.clone()));
            }
        }
        Ok(())
    }

    pub fn description(&self) -> ModelDescription {
        ModelDescription {
            version: self.header.version.clone(),
            networks: self.header.networks.clone(),
            executors: self.header.executors.clone(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<Vec<f32>> {
        let entry = self.header.parameters.get(name)?;
        let bytes = self.blob.get(entry.offset..entry.offset + entry.nbytes)?;
        Some(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
    }

    /// Every parameter decoded to f32, in name order.
    pub fn parameters(&self) -> Result<Vec<ParameterRecord>, FormatError> {
        self.header
            .parameters
            .iter()
            .map(|(name, entry)| {
                let values = self
                    .parameter(name)
                    .ok_or_else(|| FormatError::MissingData(name.clone()))?;
                Ok(ParameterRecord::new(name.clone(), &entry.shape, values))
            })
            .collect()
    }
}

/// Round `n` up to the next multiple of `align`.
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Assembles a container programmatically.
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    header: ContainerHeader,
    blob: Vec<u8>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing description; parameters are added separately.
    pub fn from_description(desc: &ModelDescription) -> Self {
        Self {
            header: ContainerHeader {
                version: desc.version.clone(),
                networks: desc.networks.clone(),
                executors: desc.executors.clone(),
                parameters: BTreeMap::new(),
            },
            blob: Vec::new(),
        }
    }

    pub fn add_network(&mut self, network: NetworkDesc) -> &mut Self {
        self.header.networks.push(network);
        self
    }

    pub fn add_executor(&mut self, executor: ExecutorDesc) -> &mut Self {
        self.header.executors.push(executor);
        self
    }

    pub fn add_parameter(&mut self, name: &str, shape: &[usize], values: &[f32]) -> &mut Self {
        self.blob.resize(align_up(self.blob.len(), BLOB_ALIGNMENT), 0);
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.header.parameters.insert(
            name.to_string(),
            TensorEntry {
                shape: shape.to_vec(),
                offset: self.blob.len(),
                nbytes: bytes.len(),
            },
        );
        self.blob.extend_from_slice(bytes);
        self
    }

    pub fn add_record(&mut self, record: &ParameterRecord) -> &mut Self {
        self.add_parameter(&record.name, &record.shape, &record.values)
    }

    pub fn build(self) -> Container {
        Container {
            header: self.header,
            blob: self.blob,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{FunctionDesc, VariableDesc};

    fn sample() -> Container {
        let mut builder = ContainerBuilder::new();
        builder
            .add_network(NetworkDesc {
                name: "main".into(),
                variables: vec![VariableDesc::buffer("x", &[-1, 2]), VariableDesc::parameter("w", &[2, 2])],
                functions: vec![FunctionDesc::new("fc", "Affine", &["x", "w"], &["y"])],
            })
            .add_executor(ExecutorDesc::new("run", "main", &["x"], &["y"]))
            .add_parameter("w", &[2, 2], &[1.0, 2.0, 3.0, 4.0])
            .add_parameter("b", &[3], &[0.5, -0.5, 0.25]);
        builder.build()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_roundtrip() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[0..4], MAGIC);

        let loaded = Container::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.header.networks[0].name, "main");
        assert_eq!(loaded.header.executors[0].outputs, vec!["y".to_string()]);
        assert_eq!(loaded.header.parameters["b"].offset % BLOB_ALIGNMENT, 0);
        assert_eq!(loaded.parameter("w").unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        let records = loaded.parameters().unwrap();
        assert_eq!(records[0], ParameterRecord::new("b", &[3], vec![0.5, -0.5, 0.25]));
        assert_eq!(records[1].name, "w");
    }

    #[test]
    fn test_empty_blob() {
        let container = ContainerBuilder::from_description(&ModelDescription::default()).build();
        let bytes = container.to_bytes().unwrap();
        let loaded = Container::from_bytes(&bytes).unwrap();
        assert!(loaded.header.parameters.is_empty());
        assert!(loaded.blob.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let data = b"BADXxxxxxxxx";
        assert!(matches!(Container::from_bytes(data), Err(FormatError::BadMagic)));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(Container::from_bytes(b"NNRT"), Err(FormatError::TooSmall)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            Container::from_bytes(&bytes),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_truncated_blob() {
        let bytes = sample().to_bytes().unwrap();
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(Container::from_bytes(cut), Err(FormatError::MissingData(_))));
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let mut container = sample();
        let entry = container.header.parameters.get_mut("b").unwrap();
        entry.shape = vec![usize::MAX, 4];
        let bytes = container.to_bytes().unwrap();

        let err = Container::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, FormatError::InvalidHeader(ref msg) if msg.contains("overflows")));
        assert!(matches!(NnrtError::from(err), NnrtError::Format(_)));
    }

    #[test]
    fn test_invalid_header_converts() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"{{{");
        let err = Container::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, FormatError::InvalidHeader(_)));
        assert!(matches!(NnrtError::from(err), NnrtError::Format(_)));
    }
}
