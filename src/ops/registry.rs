//! Versioned operator registry
//!
//! Implementations are keyed by `(domain, op_type)` and carry the range of
//! opset versions they cover. A node resolves against its explicit version
//! if it has one, otherwise against the graph's opset import for its domain.

use super::elementwise::{BinaryKind, ElementwiseBinary, Relu, Sum};
use super::identity::Identity;
use super::matmul::MatMul;
use super::softmax::Softmax;
use super::{Operator, OperatorInfo, VersionInfo};
use crate::error::{ForgeResult, GraphForgeError};
use crate::graph::description::{normalize_domain, NodeDescription, OpsetImport, DEFAULT_DOMAIN};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opset version assumed for the default domain when a graph imports none
pub const DEFAULT_OPSET_VERSION: u32 = 13;

/// Builds an operator for one node
pub type OperatorFactory =
    Arc<dyn Fn(&NodeDescription, OperatorInfo) -> ForgeResult<Arc<dyn Operator>> + Send + Sync>;

/// Opset imports of one graph: domain -> version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorSetRegistry {
    versions: HashMap<String, u32>,
}

impl OperatorSetRegistry {
    pub fn from_imports(imports: &[OpsetImport]) -> Self {
        let versions = imports
            .iter()
            .map(|import| (normalize_domain(&import.domain).to_string(), import.version))
            .collect();
        OperatorSetRegistry { versions }
    }

    /// Imported version for `domain`. The default domain falls back to
    /// [`DEFAULT_OPSET_VERSION`].
    pub fn version_for(&self, domain: &str) -> Option<u32> {
        let domain = normalize_domain(domain);
        match self.versions.get(domain) {
            Some(version) => Some(*version),
            None if domain == DEFAULT_DOMAIN => Some(DEFAULT_OPSET_VERSION),
            None => None,
        }
    }
}

struct Implementation {
    versions: VersionInfo,
    factory: OperatorFactory,
}

#[derive(Default)]
pub struct OperatorRegistry {
    entries: HashMap<(String, String), Vec<Implementation>>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.entries.len())
            .finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in operator set
    pub fn with_builtin_operators() -> Self {
        let mut registry = Self::new();

        registry.register_fn(DEFAULT_DOMAIN, "Identity", VersionInfo::since(1), |_, info| {
            Ok(Arc::new(Identity::new(info)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "Add", VersionInfo::since(7), |_, info| {
            Ok(Arc::new(ElementwiseBinary::new(info, BinaryKind::Add)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "Mul", VersionInfo::since(7), |_, info| {
            Ok(Arc::new(ElementwiseBinary::new(info, BinaryKind::Mul)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "Relu", VersionInfo::since(6), |_, info| {
            Ok(Arc::new(Relu::new(info)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "Sum", VersionInfo::since(6), |_, info| {
            Ok(Arc::new(Sum::new(info)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "MatMul", VersionInfo::since(1), |_, info| {
            Ok(Arc::new(MatMul::new(info)))
        });
        registry.register_fn(DEFAULT_DOMAIN, "Softmax", VersionInfo::since(13), |node, info| {
            Ok(Arc::new(Softmax::from_node(node, info)?))
        });

        registry
    }

    pub fn register(&mut self, domain: &str, op_type: &str, versions: VersionInfo, factory: OperatorFactory) {
        let key = (normalize_domain(domain).to_string(), op_type.to_string());
        self.entries
            .entry(key)
            .or_default()
            .push(Implementation { versions, factory });
    }

    pub fn register_fn<F>(&mut self, domain: &str, op_type: &str, versions: VersionInfo, factory: F)
    where
        F: Fn(&NodeDescription, OperatorInfo) -> ForgeResult<Arc<dyn Operator>> + Send + Sync + 'static,
    {
        self.register(domain, op_type, versions, Arc::new(factory));
    }

    pub fn contains(&self, domain: &str, op_type: &str) -> bool {
        self.entries
            .contains_key(&(normalize_domain(domain).to_string(), op_type.to_string()))
    }

    /// Registered `(domain, op_type, versions)` triples, sorted
    pub fn supported_operators(&self) -> Vec<(String, String, VersionInfo)> {
        let mut ops: Vec<_> = self
            .entries
            .iter()
            .flat_map(|((domain, op_type), impls)| {
                impls
                    .iter()
                    .map(move |i| (domain.clone(), op_type.clone(), i.versions))
            })
            .collect();
        ops.sort_by(|a, b| (&a.0, &a.1, a.2.since_version).cmp(&(&b.0, &b.1, b.2.since_version)));
        ops
    }

    /// Build the operator for `node` under the graph's opset imports
    pub fn resolve(&self, node: &NodeDescription, opsets: &OperatorSetRegistry) -> ForgeResult<Arc<dyn Operator>> {
        let domain = normalize_domain(&node.domain);
        let key = (domain.to_string(), node.op_type.clone());
        let Some(impls) = self.entries.get(&key) else {
            return Err(GraphForgeError::UnsupportedOperator {
                domain: domain.to_string(),
                op_type: node.op_type.clone(),
            });
        };

        let version = match node.version.or_else(|| opsets.version_for(domain)) {
            Some(version) => version,
            None => {
                return Err(GraphForgeError::InvalidGraph(format!(
                    "node '{}' uses domain '{}' which the graph does not import",
                    node.name, domain
                )))
            }
        };

        let implementation = impls
            .iter()
            .find(|i| i.versions.contains(version))
            .ok_or_else(|| GraphForgeError::UnsupportedOperatorVersion {
                op_type: node.op_type.clone(),
                version,
            })?;
        tracing::trace!(node = %node.name, op_type = %node.op_type, version, "resolved operator");
        (implementation.factory)(node, OperatorInfo::for_node(node, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::description::Attribute;

    fn opset(version: u32) -> OperatorSetRegistry {
        OperatorSetRegistry::from_imports(&[OpsetImport {
            domain: String::new(),
            version,
        }])
    }

    #[test]
    fn test_resolve_builtin() {
        let registry = OperatorRegistry::with_builtin_operators();
        let node = NodeDescription::new("mm", "MatMul", &["a", "b"], &["c"]);
        let op = registry.resolve(&node, &opset(11)).unwrap();
        assert_eq!(op.info().op_type, "MatMul");
        assert_eq!(op.info().version, 11);
        assert_eq!(op.name(), "mm");
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::with_builtin_operators();
        let node = NodeDescription::new("g", "Gelu", &["x"], &["y"]);
        let err = registry.resolve(&node, &opset(13)).unwrap_err();
        assert!(matches!(err, GraphForgeError::UnsupportedOperator { .. }));
        assert!(err.is_load_error());
    }

    #[test]
    fn test_version_outside_every_range() {
        let registry = OperatorRegistry::with_builtin_operators();
        let node = NodeDescription::new("s", "Softmax", &["x"], &["y"]);
        let err = registry.resolve(&node, &opset(11)).unwrap_err();
        assert!(matches!(
            err,
            GraphForgeError::UnsupportedOperatorVersion { version: 11, .. }
        ));
    }

    #[test]
    fn test_node_version_overrides_import() {
        let registry = OperatorRegistry::with_builtin_operators();
        let node = NodeDescription::new("a", "Add", &["x", "y"], &["z"]).with_version(6);
        assert!(registry.resolve(&node, &opset(13)).is_err());
        let node = node.with_version(7);
        assert_eq!(registry.resolve(&node, &opset(1)).unwrap().info().version, 7);
    }

    #[test]
    fn test_missing_import_uses_default_only_for_default_domain() {
        let opsets = OperatorSetRegistry::default();
        assert_eq!(opsets.version_for("ai.onnx"), Some(DEFAULT_OPSET_VERSION));
        assert_eq!(opsets.version_for("com.example"), None);

        let mut registry = OperatorRegistry::new();
        registry.register_fn("com.example", "Identity", VersionInfo::since(1), |_, info| {
            Ok(Arc::new(Identity::new(info)))
        });
        let node = NodeDescription::new("i", "Identity", &["x"], &["y"]).with_domain("com.example");
        assert!(matches!(
            registry.resolve(&node, &opsets).unwrap_err(),
            GraphForgeError::InvalidGraph(_)
        ));
    }

    #[test]
    fn test_factory_attribute_errors_surface_at_load() {
        let registry = OperatorRegistry::with_builtin_operators();
        let node = NodeDescription::new("s", "Softmax", &["x"], &["y"])
            .with_attribute("axis", Attribute::Floats(vec![1.0]));
        assert!(matches!(
            registry.resolve(&node, &opset(13)).unwrap_err(),
            GraphForgeError::InvalidAttribute { .. }
        ));
    }

    #[test]
    fn test_supported_operators_listing() {
        let registry = OperatorRegistry::with_builtin_operators();
        let ops = registry.supported_operators();
        let matmuls: Vec<_> = ops.iter().filter(|(_, op, _)| op == "MatMul").collect();
        assert_eq!(matmuls.len(), 1);
        assert_eq!(matmuls[0].2, VersionInfo::since(1));
        assert!(registry.contains("ai.onnx", "Relu"));
    }

    #[test]
    fn test_version_ranges_select_their_own_factory() {
        let mut registry = OperatorRegistry::new();
        registry.register_fn("", "Relu", VersionInfo::range(1, 6), |_, info| Ok(Arc::new(Identity::new(info))));
        registry.register_fn("", "Relu", VersionInfo::since(6), |_, info| Ok(Arc::new(Relu::new(info))));
        let node = NodeDescription::new("r", "Relu", &["x"], &["y"]);

        let old = registry.resolve(&node, &opset(5)).unwrap();
        let new = registry.resolve(&node, &opset(13)).unwrap();
        assert!(format!("{:?}", old).starts_with("Identity"));
        assert!(format!("{:?}", new).starts_with("Relu"));
        assert_eq!(registry.supported_operators().len(), 2);
    }
}
