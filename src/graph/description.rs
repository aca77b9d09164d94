//! Already-parsed graph descriptions
//!
//! Graphs arrive as plain data: node list, graph inputs and outputs,
//! initializer tensors and opset imports. They can be built in code or read
//! from JSON:
//!
//! ```json
//! {
//!   "name": "affine",
//!   "opset_imports": [{ "domain": "", "version": 13 }],
//!   "inputs": ["x"],
//!   "outputs": ["y"],
//!   "initializers": [{ "name": "w", "data_type": "float32", "dims": [2, 2], "values": [1, 0, 0, 1] }],
//!   "nodes": [{ "name": "mm", "op_type": "MatMul", "inputs": ["x", "w"], "outputs": ["y"] }]
//! }
//! ```

use crate::error::{ForgeResult, GraphForgeError};
use crate::memory::DataType;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default operator domain; `ai.onnx` is accepted as an alias
pub const DEFAULT_DOMAIN: &str = "";

pub fn normalize_domain(domain: &str) -> &str {
    if domain == "ai.onnx" {
        DEFAULT_DOMAIN
    } else {
        domain
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsetImport {
    #[serde(default)]
    pub domain: String,
    pub version: u32,
}

/// Node attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strings(Vec<String>),
}

impl Attribute {
    pub fn kind(&self) -> &'static str {
        match self {
            Attribute::Int(_) => "int",
            Attribute::Float(_) => "float",
            Attribute::String(_) => "string",
            Attribute::Ints(_) => "ints",
            Attribute::Floats(_) => "floats",
            Attribute::Strings(_) => "strings",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers are accepted where a float is expected
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Attribute::Float(v) => Some(*v),
            Attribute::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    /// Overrides the opset import for this node's domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Attribute>,
    /// Empty names mark absent optional inputs
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl NodeDescription {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        NodeDescription {
            name: name.into(),
            op_type: op_type.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            version: None,
            attributes: HashMap::new(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Integer attribute, `default` when absent
    pub fn int_attribute(&self, key: &str, default: i64) -> ForgeResult<i64> {
        match self.attributes.get(key) {
            None => Ok(default),
            Some(value) => value.as_int().ok_or_else(|| GraphForgeError::InvalidAttribute {
                node: self.name.clone(),
                attribute: key.to_string(),
                reason: format!("expected int, found {}", value.kind()),
            }),
        }
    }

    pub fn float_attribute(&self, key: &str, default: f64) -> ForgeResult<f64> {
        match self.attributes.get(key) {
            None => Ok(default),
            Some(value) => value.as_float().ok_or_else(|| GraphForgeError::InvalidAttribute {
                node: self.name.clone(),
                attribute: key.to_string(),
                reason: format!("expected float, found {}", value.kind()),
            }),
        }
    }

    pub fn required_attribute(&self, key: &str) -> ForgeResult<&Attribute> {
        self.attributes.get(key).ok_or_else(|| GraphForgeError::MissingAttribute {
            node: self.name.clone(),
            attribute: key.to_string(),
        })
    }
}

/// Tensor values as plain data, used for initializers and CLI input/output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub dims: Vec<usize>,
    #[serde(default)]
    pub values: Vec<f64>,
}

pub type InitializerDescription = TensorData;

impl TensorData {
    pub fn new(name: impl Into<String>, data_type: DataType, dims: &[usize], values: Vec<f64>) -> Self {
        TensorData {
            name: name.into(),
            data_type,
            dims: dims.to_vec(),
            values,
        }
    }

    /// Detached tensor holding these values
    pub fn to_tensor(&self) -> ForgeResult<Tensor> {
        Tensor::from_f64_values(&self.name, self.data_type, &self.dims, &self.values)
    }

    pub fn from_tensor(tensor: &Tensor) -> ForgeResult<Self> {
        Ok(TensorData {
            name: tensor.name().to_string(),
            data_type: tensor.data_type(),
            dims: tensor.shape().to_vec(),
            values: tensor.to_f64_vec()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub model_version: i64,
    #[serde(default)]
    pub opset_imports: Vec<OpsetImport>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub initializers: Vec<InitializerDescription>,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
}

impl GraphDescription {
    pub fn new(name: impl Into<String>) -> Self {
        GraphDescription {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_opset(mut self, domain: impl Into<String>, version: u32) -> Self {
        self.opset_imports.push(OpsetImport {
            domain: domain.into(),
            version,
        });
        self
    }

    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_initializer(mut self, initializer: InitializerDescription) -> Self {
        self.initializers.push(initializer);
        self
    }

    pub fn with_node(mut self, node: NodeDescription) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn from_json(json: &str) -> ForgeResult<Self> {
        let mut graph: GraphDescription = serde_json::from_str(json)?;
        graph.assign_node_names();
        Ok(graph)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Give unnamed nodes a stable `{op_type}_{index}` name
    pub fn assign_node_names(&mut self) {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if node.name.is_empty() {
                node.name = format!("{}_{}", node.op_type, index);
            }
        }
    }
}
