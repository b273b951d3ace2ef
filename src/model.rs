use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::op_registry::{OpRegistry, ReadOpError};
use crate::ops::{Attrs, DataType, Input};
use crate::tensor::Tensor;

/// Version of the interchange document format.
pub const FORMAT_VERSION: u32 = 1;

/// Root of the interchange document that graphs are exported to for shape
/// inference and serialized to disk as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDoc {
    pub version: u32,
    pub graph: GraphDoc,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDoc {
    /// Operator nodes in execution order.
    pub nodes: Vec<NodeDoc>,

    /// Declared graph inputs.
    pub inputs: Vec<ValueDoc>,

    /// Declared graph outputs.
    pub outputs: Vec<ValueDoc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constants: Vec<ConstantDoc>,

    /// Shape and type annotations for intermediate values, populated by
    /// shape inference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_info: Vec<ValueDoc>,
}

/// An operator node. Inputs and outputs reference values by name; an empty
/// name marks an omitted optional input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub op_type: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<DimDoc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DataType>,
}

/// A dimension in the document: a fixed size or a symbolic name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimDoc {
    Fixed(usize),
    Symbolic(String),
}

impl From<&Dimension> for DimDoc {
    fn from(dim: &Dimension) -> DimDoc {
        match dim {
            Dimension::Fixed(size) => DimDoc::Fixed(*size),
            Dimension::Symbolic(name) => DimDoc::Symbolic(name.clone()),
        }
    }
}

impl From<&DimDoc> for Dimension {
    fn from(dim: &DimDoc) -> Dimension {
        match dim {
            DimDoc::Fixed(size) => Dimension::Fixed(*size),
            DimDoc::Symbolic(name) => Dimension::Symbolic(name.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantDoc {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: ConstData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstData {
    Float(Vec<f32>),
    Int32(Vec<i32>),
}

/// Errors from exporting a graph to the interchange form.
#[derive(Debug, PartialEq)]
pub enum ExportError {
    /// The graph's operators cannot be ordered for serialization.
    CyclicGraph,

    /// An operator references a node that does not exist.
    InvalidNodeId(NodeId),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::CyclicGraph => write!(f, "graph contains a cycle"),
            ExportError::InvalidNodeId(id) => write!(f, "node ID {} is invalid", id),
        }
    }
}

impl Error for ExportError {}

/// Errors from importing or loading an interchange document.
#[derive(Debug)]
pub enum LoadError {
    /// The document was produced by a newer version of the format.
    UnsupportedVersion(u32),

    /// Two declarations share a name.
    DuplicateName(String),

    /// A constant's data length does not match its shape.
    InvalidConstant(String),

    /// An operator could not be deserialized.
    OperatorInvalid {
        /// Display name of the node.
        name: String,
        error: ReadOpError,
    },

    /// The document's operators form a cycle.
    CyclicGraph,

    Io(io::Error),
    Json(serde_json::Error),
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::UnsupportedVersion(version) => {
                write!(f, "unsupported format version {}", version)
            }
            LoadError::DuplicateName(name) => write!(f, "duplicate value name \"{}\"", name),
            LoadError::InvalidConstant(name) => {
                write!(f, "constant \"{}\" has inconsistent shape and data", name)
            }
            LoadError::OperatorInvalid { name, error } => {
                write!(f, "failed to read operator \"{}\": {}", name, error)
            }
            LoadError::CyclicGraph => write!(f, "document graph contains a cycle"),
            LoadError::Io(err) => write!(f, "read failed: {}", err),
            LoadError::Json(err) => write!(f, "parse failed: {}", err),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoadError::Io(err) => Some(err),
            LoadError::Json(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors from saving a graph to a file.
#[derive(Debug)]
pub enum SaveError {
    Export(ExportError),
    Io(io::Error),
    Json(serde_json::Error),
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveError::Export(err) => write!(f, "export failed: {}", err),
            SaveError::Io(err) => write!(f, "write failed: {}", err),
            SaveError::Json(err) => write!(f, "serialization failed: {}", err),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SaveError::Export(err) => Some(err),
            SaveError::Io(err) => Some(err),
            SaveError::Json(err) => Some(err),
        }
    }
}

/// Return the interchange name for a value or constant node.
///
/// Anonymous nodes get a generated name so operator references in the
/// document resolve.
fn value_name(graph: &Graph, id: NodeId) -> String {
    match graph.get_node(id) {
        Some(node) => node
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|| match node {
                Node::Constant(_) => format!("__c{}", id),
                _ => format!("__v{}", id),
            }),
        None => format!("__v{}", id),
    }
}

fn value_doc(graph: &Graph, id: NodeId) -> Result<ValueDoc, ExportError> {
    let node = graph.get_node(id).ok_or(ExportError::InvalidNodeId(id))?;
    Ok(ValueDoc {
        name: value_name(graph, id),
        shape: node
            .shape()
            .map(|dims| dims.iter().map(DimDoc::from).collect()),
        dtype: node.dtype(),
    })
}

/// Export a graph to the interchange form.
///
/// Operator nodes are emitted in execution order.
pub fn export_model(graph: &Graph) -> Result<ModelDoc, ExportError> {
    let order = graph
        .execution_order()
        .map_err(|_| ExportError::CyclicGraph)?;

    let inputs = graph
        .input_ids()
        .iter()
        .map(|&id| value_doc(graph, id))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = graph
        .output_ids()
        .iter()
        .map(|&id| value_doc(graph, id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut constants = Vec::new();
    let mut value_info = Vec::new();
    for (id, node) in graph.iter() {
        match node {
            Node::Constant(constant) => {
                let data = match constant.as_input() {
                    Input::FloatTensor(t) => ConstData::Float(t.data().to_vec()),
                    Input::IntTensor(t) => ConstData::Int32(t.data().to_vec()),
                };
                constants.push(ConstantDoc {
                    name: value_name(graph, id),
                    shape: constant.shape().to_vec(),
                    data,
                });
            }
            Node::Value(value) => {
                let declared = graph.input_ids().contains(&id) || graph.output_ids().contains(&id);
                if !declared && (value.shape().is_some() || node.dtype().is_some()) {
                    value_info.push(value_doc(graph, id)?);
                }
            }
            Node::Operator(_) => {}
        }
    }

    let mut nodes = Vec::with_capacity(order.len());
    for op_id in order {
        let op_node = graph
            .get_node(op_id)
            .and_then(Node::as_operator)
            .ok_or(ExportError::InvalidNodeId(op_id))?;

        let id_to_name = |slot: &Option<NodeId>| match slot {
            Some(id) => value_name(graph, *id),
            None => String::new(),
        };
        nodes.push(NodeDoc {
            name: op_node.name().map(|name| name.to_string()),
            op_type: op_node.operator().name().to_string(),
            attrs: op_node
                .operator()
                .attributes()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
            inputs: op_node.input_ids().iter().map(id_to_name).collect(),
            outputs: op_node.output_ids().iter().map(id_to_name).collect(),
        });
    }

    Ok(ModelDoc {
        version: FORMAT_VERSION,
        graph: GraphDoc {
            nodes,
            inputs,
            outputs,
            constants,
            value_info,
        },
    })
}

/// Import an interchange document into a graph, instantiating operators via
/// the registry.
pub fn import_model(doc: &ModelDoc, registry: &OpRegistry) -> Result<Graph, LoadError> {
    if doc.version > FORMAT_VERSION {
        return Err(LoadError::UnsupportedVersion(doc.version));
    }

    let mut graph = Graph::new();
    let mut ids: FxHashMap<&str, NodeId> = FxHashMap::default();

    for constant in &doc.graph.constants {
        let expected_len: usize = constant.shape.iter().product();
        let id = match &constant.data {
            ConstData::Float(data) => {
                if data.len() != expected_len {
                    return Err(LoadError::InvalidConstant(constant.name.clone()));
                }
                graph.add_constant(Some(&constant.name), Tensor::from_data(&constant.shape, data.clone()))
            }
            ConstData::Int32(data) => {
                if data.len() != expected_len {
                    return Err(LoadError::InvalidConstant(constant.name.clone()));
                }
                graph.add_constant(Some(&constant.name), Tensor::from_data(&constant.shape, data.clone()))
            }
        };
        if ids.insert(&constant.name, id).is_some() {
            return Err(LoadError::DuplicateName(constant.name.clone()));
        }
    }

    let dims_from_doc = |shape: &Option<Vec<DimDoc>>| -> Option<Vec<Dimension>> {
        shape
            .as_ref()
            .map(|dims| dims.iter().map(Dimension::from).collect())
    };

    for value in doc.graph.inputs.iter().chain(&doc.graph.value_info) {
        let id = graph.add_value(Some(&value.name), dims_from_doc(&value.shape), value.dtype);
        if ids.insert(&value.name, id).is_some() {
            return Err(LoadError::DuplicateName(value.name.clone()));
        }
    }

    // Outputs may already be declared via `value_info`, or even be a
    // passthrough of an input or constant.
    for value in &doc.graph.outputs {
        if !ids.contains_key(value.name.as_str()) {
            let id = graph.add_value(Some(&value.name), dims_from_doc(&value.shape), value.dtype);
            ids.insert(&value.name, id);
        }
    }

    // Names referenced by operators but not declared anywhere become bare
    // value nodes.
    fn resolve_name<'doc>(
        graph: &mut Graph,
        ids: &mut FxHashMap<&'doc str, NodeId>,
        name: &'doc str,
    ) -> Option<NodeId> {
        if name.is_empty() {
            return None;
        }
        match ids.get(name) {
            Some(&id) => Some(id),
            None => {
                let id = graph.add_value(Some(name), None, None);
                ids.insert(name, id);
                Some(id)
            }
        }
    }

    for node in &doc.graph.nodes {
        let op = registry
            .create(&node.op_type, &node.attrs)
            .map_err(|error| LoadError::OperatorInvalid {
                name: node.name.clone().unwrap_or_else(|| node.op_type.clone()),
                error,
            })?;

        let inputs: Vec<Option<NodeId>> = node
            .inputs
            .iter()
            .map(|name| resolve_name(&mut graph, &mut ids, name))
            .collect();
        let outputs: Vec<Option<NodeId>> = node
            .outputs
            .iter()
            .map(|name| resolve_name(&mut graph, &mut ids, name))
            .collect();

        graph.add_op(node.name.as_deref(), op, &inputs, &outputs);
    }

    let declared_ids = |values: &[ValueDoc]| -> Vec<NodeId> {
        values
            .iter()
            .filter_map(|value| ids.get(value.name.as_str()).copied())
            .collect()
    };
    graph.set_input_ids(&declared_ids(&doc.graph.inputs));
    graph.set_output_ids(&declared_ids(&doc.graph.outputs));

    graph.toposort().map_err(|_| LoadError::CyclicGraph)?;
    Ok(graph)
}

/// Load a graph from an interchange JSON file.
pub fn load_model<P: AsRef<Path>>(path: P, registry: &OpRegistry) -> Result<Graph, LoadError> {
    let json = fs::read_to_string(path).map_err(LoadError::Io)?;
    let doc: ModelDoc = serde_json::from_str(&json).map_err(LoadError::Json)?;
    import_model(&doc, registry)
}

/// Save a graph to an interchange JSON file.
pub fn save_model<P: AsRef<Path>>(path: P, graph: &Graph) -> Result<(), SaveError> {
    let doc = export_model(graph).map_err(SaveError::Export)?;
    let json = serde_json::to_string_pretty(&doc).map_err(SaveError::Json)?;
    fs::write(path, json).map_err(SaveError::Io)
}

#[cfg(test)]
mod tests {
    use super::{export_model, import_model, DimDoc, LoadError, ModelDoc, FORMAT_VERSION};
    use crate::graph::{Dimension, Graph, Node};
    use crate::op_registry::OpRegistry;
    use crate::ops::{Add, Concat, DataType, Shape};
    use crate::tensor::Tensor;

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        let input = g.add_value(
            Some("input"),
            Some(vec![Dimension::Symbolic("batch".to_string()), 3.into()]),
            Some(DataType::Float),
        );
        let bias = g.add_constant(Some("bias"), Tensor::from_scalar(1.0f32));
        let biased = g.add_value(Some("biased"), None, None);
        g.add_op(
            Some("add_bias"),
            Box::new(Add {}),
            &[Some(input), Some(bias)],
            &[Some(biased)],
        );
        let shape = g.add_value(Some("shape"), None, None);
        g.add_op(
            Some("shape_of"),
            Box::new(Shape {}),
            &[Some(biased)],
            &[Some(shape)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[biased, shape]);
        g
    }

    #[test]
    fn test_export_structure() {
        let g = sample_graph();
        let doc = export_model(&g).unwrap();

        assert_eq!(doc.version, FORMAT_VERSION);
        assert_eq!(doc.graph.nodes.len(), 2);
        assert_eq!(doc.graph.nodes[0].op_type, "Add");
        assert_eq!(doc.graph.nodes[1].op_type, "Shape");
        assert_eq!(doc.graph.inputs.len(), 1);
        assert_eq!(
            doc.graph.inputs[0].shape,
            Some(vec![
                DimDoc::Symbolic("batch".to_string()),
                DimDoc::Fixed(3)
            ])
        );
        assert_eq!(doc.graph.outputs.len(), 2);
        assert_eq!(doc.graph.constants.len(), 1);
        assert_eq!(doc.graph.constants[0].name, "bias");
    }

    #[test]
    fn test_round_trip() {
        let g = sample_graph();
        let doc = export_model(&g).unwrap();
        let restored = import_model(&doc, &OpRegistry::with_all_ops()).unwrap();

        assert_eq!(restored.operator_count(), g.operator_count());
        assert_eq!(restored.input_ids().len(), 1);
        assert_eq!(restored.output_ids().len(), 2);
        assert!(restored.get_node_id("add_bias").is_some());
        assert!(restored.get_node_id("shape_of").is_some());

        let bias_id = restored.get_node_id("bias").unwrap();
        let bias = restored
            .get_node(bias_id)
            .and_then(Node::as_constant)
            .unwrap();
        assert_eq!(bias.dtype(), DataType::Float);
        assert_eq!(bias.shape(), &[] as &[usize]);

        let input_id = restored.get_node_id("input").unwrap();
        assert_eq!(
            restored.get_node(input_id).and_then(|n| n.shape()),
            Some(vec![
                Dimension::Symbolic("batch".to_string()),
                Dimension::Fixed(3)
            ])
        );
    }

    #[test]
    fn test_json_round_trip() {
        let g = sample_graph();
        let doc = export_model(&g).unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: ModelDoc = serde_json::from_str(&json).unwrap();
        let restored = import_model(&parsed, &OpRegistry::with_all_ops()).unwrap();
        assert_eq!(restored.operator_count(), 2);
    }

    #[test]
    fn test_import_attrs() {
        let mut g = Graph::new();
        let a = g.add_value(Some("a"), None, None);
        let b = g.add_value(Some("b"), None, None);
        let out = g.add_value(Some("out"), None, None);
        g.add_op(
            Some("cat"),
            Box::new(Concat { axis: -1 }),
            &[Some(a), Some(b)],
            &[Some(out)],
        );
        g.set_input_ids(&[a, b]);
        g.set_output_ids(&[out]);

        let doc = export_model(&g).unwrap();
        let restored = import_model(&doc, &OpRegistry::with_all_ops()).unwrap();
        let cat_id = restored.get_node_id("cat").unwrap();
        let op = restored.get_node(cat_id).and_then(Node::as_operator).unwrap();
        assert_eq!(op.operator().name(), "Concat");
        // Attribute survives the round trip.
        let attrs = op.operator().attributes();
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_import_unknown_op() {
        let g = sample_graph();
        let doc = export_model(&g).unwrap();
        let result = import_model(&doc, &OpRegistry::new());
        assert!(matches!(
            result,
            Err(LoadError::OperatorInvalid { .. })
        ));
    }

    #[test]
    fn test_import_unsupported_version() {
        let g = sample_graph();
        let mut doc = export_model(&g).unwrap();
        doc.version = FORMAT_VERSION + 1;
        let result = import_model(&doc, &OpRegistry::with_all_ops());
        assert!(matches!(result, Err(LoadError::UnsupportedVersion(_))));
    }
}
