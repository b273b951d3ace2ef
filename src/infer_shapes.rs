//! Structural shape inference over the interchange form.
//!
//! Shapes are propagated from declared inputs and constants through
//! per-operator dimension rules, without executing the graph. Results are
//! recorded in the document's `value_info` section, where a later import
//! attaches them to value nodes.

use std::error::Error;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::model::{ConstData, DimDoc, ModelDoc, NodeDoc, ValueDoc};
use crate::ops::AttrValue;

/// Inferred size of a single dimension.
#[derive(Clone, Debug, PartialEq)]
pub enum InferredDim {
    Fixed(usize),
    Symbolic(String),
    /// The dimension has a size that cannot be determined statically.
    Unknown,
}

impl From<&DimDoc> for InferredDim {
    fn from(dim: &DimDoc) -> InferredDim {
        match dim {
            DimDoc::Fixed(size) => InferredDim::Fixed(*size),
            DimDoc::Symbolic(name) => InferredDim::Symbolic(name.clone()),
        }
    }
}

type Dims = Vec<InferredDim>;

/// Reasons why shape inference over a document failed.
///
/// Inference is best-effort from the refiner's point of view: these errors
/// are surfaced to the caller, which may treat them as a skipped attempt
/// rather than a fatal condition.
#[derive(Clone, Debug, PartialEq)]
pub enum ShapeInferenceError {
    /// An operator has too many or too few inputs.
    IncorrectInputCount,

    /// Input shapes are incompatible with each other or with the operator's
    /// attributes.
    IncompatibleShapes,

    /// An operator has no inference rule.
    UnsupportedOperator(String),

    /// A required attribute is missing or has the wrong type.
    MissingAttr(&'static str),
}

impl fmt::Display for ShapeInferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeInferenceError::IncorrectInputCount => {
                write!(f, "operator has an incorrect number of inputs")
            }
            ShapeInferenceError::IncompatibleShapes => {
                write!(f, "input shapes are incompatible")
            }
            ShapeInferenceError::UnsupportedOperator(name) => {
                write!(f, "no shape inference rule for operator {}", name)
            }
            ShapeInferenceError::MissingAttr(name) => {
                write!(f, "attribute \"{}\" is missing or invalid", name)
            }
        }
    }
}

impl Error for ShapeInferenceError {}

/// Broadcast two shapes together, in the manner of elementwise binary
/// operators.
fn broadcast_dims(a: &Dims, b: &Dims) -> Result<Dims, ShapeInferenceError> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());

    let a_iter = std::iter::repeat(&InferredDim::Fixed(1))
        .take(a_pad)
        .chain(a.iter());
    let b_iter = std::iter::repeat(&InferredDim::Fixed(1))
        .take(b_pad)
        .chain(b.iter());

    let mut out_dims = Vec::with_capacity(a.len().max(b.len()));
    for (x, y) in a_iter.zip(b_iter) {
        let dim = match (x, y) {
            (InferredDim::Unknown, _) | (_, InferredDim::Unknown) => InferredDim::Unknown,
            (x, y) if x == y => x.clone(),

            // A size-1 dimension broadcasts against the other size.
            (InferredDim::Fixed(1), y) => y.clone(),
            (x, InferredDim::Fixed(1)) => x.clone(),

            // Two different fixed sizes cannot broadcast.
            (InferredDim::Fixed(_), InferredDim::Fixed(_)) => {
                return Err(ShapeInferenceError::IncompatibleShapes);
            }

            // A symbolic dim paired with a fixed size other than 1 can only
            // succeed at runtime if the symbol has that size.
            (InferredDim::Symbolic(_), InferredDim::Fixed(size)) => InferredDim::Fixed(*size),
            (InferredDim::Fixed(size), InferredDim::Symbolic(_)) => InferredDim::Fixed(*size),

            // Two different symbols: the result depends on runtime sizes.
            (InferredDim::Symbolic(_), InferredDim::Symbolic(_)) => InferredDim::Unknown,
        };
        out_dims.push(dim);
    }
    Ok(out_dims)
}

/// Merge two dims that execution requires to be equal, preferring the more
/// concrete one.
fn merge_dims(a: &InferredDim, b: &InferredDim) -> Result<InferredDim, ShapeInferenceError> {
    match (a, b) {
        (x, y) if x == y => Ok(x.clone()),
        (InferredDim::Fixed(_), InferredDim::Fixed(_)) => {
            Err(ShapeInferenceError::IncompatibleShapes)
        }
        (InferredDim::Fixed(size), _) | (_, InferredDim::Fixed(size)) => {
            Ok(InferredDim::Fixed(*size))
        }
        _ => Ok(InferredDim::Unknown),
    }
}

fn require_int_attr(node: &NodeDoc, name: &'static str) -> Result<i64, ShapeInferenceError> {
    match node.attrs.get(name) {
        Some(AttrValue::Int(value)) => Ok(*value),
        _ => Err(ShapeInferenceError::MissingAttr(name)),
    }
}

fn require_ints_attr<'a>(
    node: &'a NodeDoc,
    name: &'static str,
) -> Result<&'a [i64], ShapeInferenceError> {
    match node.attrs.get(name) {
        Some(AttrValue::Ints(values)) => Ok(values),
        _ => Err(ShapeInferenceError::MissingAttr(name)),
    }
}

fn resolve_axis(ndim: usize, axis: i64) -> Result<usize, ShapeInferenceError> {
    let resolved = if axis < 0 { axis + ndim as i64 } else { axis };
    if resolved < 0 || resolved >= ndim.max(1) as i64 {
        Err(ShapeInferenceError::IncompatibleShapes)
    } else {
        Ok(resolved as usize)
    }
}

/// Infer output dims for one operator. `None` entries mean the output's
/// shape could not be determined, which is not an error.
fn infer_node(
    node: &NodeDoc,
    shapes: &FxHashMap<&str, Dims>,
    const_ints: &FxHashMap<&str, Vec<i64>>,
) -> Result<Vec<Option<Dims>>, ShapeInferenceError> {
    let input = |index: usize| {
        node.inputs
            .get(index)
            .filter(|name| !name.is_empty())
            .and_then(|name| shapes.get(name.as_str()))
    };
    let expect_inputs = |count: usize| -> Result<(), ShapeInferenceError> {
        if node.inputs.len() == count {
            Ok(())
        } else {
            Err(ShapeInferenceError::IncorrectInputCount)
        }
    };

    let out_dims: Option<Dims> = match node.op_type.as_str() {
        "Identity" | "Cast" => {
            expect_inputs(1)?;
            input(0).cloned()
        }
        "Add" | "Mul" => {
            expect_inputs(2)?;
            match (input(0), input(1)) {
                (Some(a), Some(b)) => Some(broadcast_dims(a, b)?),
                _ => None,
            }
        }
        "Concat" => {
            if node.inputs.is_empty() {
                return Err(ShapeInferenceError::IncorrectInputCount);
            }
            let axis = require_int_attr(node, "axis")?;
            let all_dims: Option<Vec<&Dims>> = (0..node.inputs.len()).map(input).collect();
            match all_dims {
                Some(all_dims) => {
                    let first = all_dims[0];
                    if all_dims.iter().any(|dims| dims.len() != first.len()) {
                        return Err(ShapeInferenceError::IncompatibleShapes);
                    }
                    let axis = resolve_axis(first.len(), axis)?;

                    let mut out = Vec::with_capacity(first.len());
                    for index in 0..first.len() {
                        if index == axis {
                            let sum: Option<usize> = all_dims
                                .iter()
                                .map(|dims| match &dims[index] {
                                    InferredDim::Fixed(size) => Some(*size),
                                    _ => None,
                                })
                                .sum();
                            out.push(match sum {
                                Some(size) => InferredDim::Fixed(size),
                                None => InferredDim::Unknown,
                            });
                        } else {
                            let mut dim = first[index].clone();
                            for dims in &all_dims[1..] {
                                dim = merge_dims(&dim, &dims[index])?;
                            }
                            out.push(dim);
                        }
                    }
                    Some(out)
                }
                None => None,
            }
        }
        "Shape" => {
            expect_inputs(1)?;
            input(0).map(|dims| vec![InferredDim::Fixed(dims.len())])
        }
        "Unsqueeze" => {
            expect_inputs(1)?;
            let axes = require_ints_attr(node, "axes")?;
            match input(0) {
                Some(dims) => {
                    let out_ndim = dims.len() + axes.len();
                    let mut resolved: SmallVec<[usize; 4]> = SmallVec::new();
                    for &axis in axes {
                        resolved.push(resolve_axis(out_ndim, axis)?);
                    }
                    let mut out = Vec::with_capacity(out_ndim);
                    let mut input_dims = dims.iter();
                    for index in 0..out_ndim {
                        if resolved.contains(&index) {
                            out.push(InferredDim::Fixed(1));
                        } else {
                            match input_dims.next() {
                                Some(dim) => out.push(dim.clone()),
                                None => return Err(ShapeInferenceError::IncompatibleShapes),
                            }
                        }
                    }
                    Some(out)
                }
                None => None,
            }
        }
        "Reshape" => {
            expect_inputs(2)?;
            let target = node
                .inputs
                .get(1)
                .and_then(|name| const_ints.get(name.as_str()));
            match target {
                Some(request) => {
                    let in_dims = input(0);

                    // Element count of the data input, when fully fixed, used
                    // to resolve a -1 entry.
                    let in_len: Option<usize> = in_dims.and_then(|dims| {
                        dims.iter()
                            .map(|dim| match dim {
                                InferredDim::Fixed(size) => Some(*size),
                                _ => None,
                            })
                            .product()
                    });

                    let mut known_product: Option<usize> = Some(1);
                    let mut out: Dims = Vec::with_capacity(request.len());
                    for (index, &entry) in request.iter().enumerate() {
                        let dim = match entry {
                            -1 => InferredDim::Unknown,
                            0 => match in_dims.and_then(|dims| dims.get(index)) {
                                Some(dim) => dim.clone(),
                                None => InferredDim::Unknown,
                            },
                            size if size > 0 => InferredDim::Fixed(size as usize),
                            _ => return Err(ShapeInferenceError::IncompatibleShapes),
                        };
                        known_product = match (&known_product, &dim) {
                            (Some(product), InferredDim::Fixed(size)) => Some(product * size),
                            _ => None,
                        };
                        out.push(dim);
                    }

                    // Resolve a single -1 when everything else is known.
                    if let (Some(len), Some(product)) = (in_len, known_product) {
                        let wildcards: Vec<usize> = request
                            .iter()
                            .enumerate()
                            .filter(|(_, &entry)| entry == -1)
                            .map(|(index, _)| index)
                            .collect();
                        if let [index] = wildcards[..] {
                            if product > 0 && len % product == 0 {
                                out[index] = InferredDim::Fixed(len / product);
                            }
                        }
                    }
                    Some(out)
                }
                None => None,
            }
        }
        other => {
            return Err(ShapeInferenceError::UnsupportedOperator(other.to_string()));
        }
    };

    let mut result = vec![None; node.outputs.len()];
    if let Some(first) = result.first_mut() {
        *first = out_dims;
    }
    Ok(result)
}

/// Convert inferred dims into document dims, or `None` if any dim is
/// unknown.
fn dims_to_doc(dims: &Dims) -> Option<Vec<DimDoc>> {
    dims.iter()
        .map(|dim| match dim {
            InferredDim::Fixed(size) => Some(DimDoc::Fixed(*size)),
            InferredDim::Symbolic(name) => Some(DimDoc::Symbolic(name.clone())),
            InferredDim::Unknown => None,
        })
        .collect()
}

/// Run shape inference over an interchange document.
///
/// Returns a copy of the document with inferred shapes recorded on outputs
/// and in `value_info`. Nodes must be in execution order, as produced by
/// [`crate::model::export_model`].
pub fn infer_shapes(doc: &ModelDoc) -> Result<ModelDoc, ShapeInferenceError> {
    let mut shapes: FxHashMap<&str, Dims> = FxHashMap::default();
    let mut const_ints: FxHashMap<&str, Vec<i64>> = FxHashMap::default();

    for value in doc
        .graph
        .inputs
        .iter()
        .chain(&doc.graph.value_info)
        .chain(&doc.graph.outputs)
    {
        if let Some(shape) = &value.shape {
            shapes.insert(&value.name, shape.iter().map(InferredDim::from).collect());
        }
    }
    for constant in &doc.graph.constants {
        shapes.insert(
            &constant.name,
            constant
                .shape
                .iter()
                .map(|&size| InferredDim::Fixed(size))
                .collect(),
        );
        if let ConstData::Int32(data) = &constant.data {
            const_ints.insert(&constant.name, data.iter().map(|&x| x as i64).collect());
        }
    }

    for node in &doc.graph.nodes {
        let out_dims = infer_node(node, &shapes, &const_ints)?;
        for (name, dims) in node.outputs.iter().zip(out_dims) {
            if let (false, Some(dims)) = (name.is_empty(), dims) {
                shapes.insert(name, dims);
            }
        }
    }

    let mut new_doc = doc.clone();

    let fill_shape = |value: &mut ValueDoc| {
        if value.shape.is_none() {
            if let Some(dims) = shapes.get(value.name.as_str()) {
                value.shape = dims_to_doc(dims);
            }
        }
    };
    new_doc.graph.outputs.iter_mut().for_each(fill_shape);
    new_doc.graph.value_info.iter_mut().for_each(fill_shape);

    // Record shapes for intermediates that have no value_info entry yet.
    let mut declared: FxHashSet<&str> = doc
        .graph
        .inputs
        .iter()
        .chain(&doc.graph.outputs)
        .chain(&doc.graph.value_info)
        .map(|value| value.name.as_str())
        .chain(doc.graph.constants.iter().map(|c| c.name.as_str()))
        .collect();
    for node in &doc.graph.nodes {
        for name in &node.outputs {
            if name.is_empty() || !declared.insert(name) {
                continue;
            }
            if let Some(shape) = shapes.get(name.as_str()).and_then(dims_to_doc) {
                new_doc.graph.value_info.push(ValueDoc {
                    name: name.clone(),
                    shape: Some(shape),
                    dtype: None,
                });
            }
        }
    }

    Ok(new_doc)
}
