use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::graph::Dimension;
use crate::tensor::Tensor;

mod binary_elementwise;
mod compute_shape;
mod concat;
mod convert;
mod identity;
mod layout;

pub use binary_elementwise::{Add, Mul};
pub use compute_shape::Shape;
pub use concat::Concat;
pub use convert::Cast;
pub use identity::Identity;
pub use layout::{Reshape, Unsqueeze};

/// Element type of a tensor value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int32,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int32 => "int32",
        }
    }

    pub fn from_name(name: &str) -> Option<DataType> {
        match name {
            "float" => Some(DataType::Float),
            "int32" => Some(DataType::Int32),
            _ => None,
        }
    }
}

/// Enum of the different types of input tensor that an operator can accept.
#[derive(Clone, Copy, Debug)]
pub enum Input<'a> {
    FloatTensor(&'a Tensor<f32>),
    IntTensor(&'a Tensor<i32>),
}

impl<'a> Input<'a> {
    pub fn shape(&self) -> &'a [usize] {
        match self {
            Input::FloatTensor(t) => t.shape(),
            Input::IntTensor(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        match self {
            Input::FloatTensor(t) => t.len(),
            Input::IntTensor(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Input::FloatTensor(_) => DataType::Float,
            Input::IntTensor(_) => DataType::Int32,
        }
    }

    pub fn as_float(&self) -> Option<&'a Tensor<f32>> {
        match self {
            Input::FloatTensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&'a Tensor<i32>> {
        match self {
            Input::IntTensor(t) => Some(t),
            _ => None,
        }
    }

    /// Copy the referenced tensor into an owned output.
    pub fn to_output(&self) -> Output {
        match self {
            Input::FloatTensor(t) => Output::FloatTensor((*t).clone()),
            Input::IntTensor(t) => Output::IntTensor((*t).clone()),
        }
    }
}

impl<'a> From<&'a Tensor<f32>> for Input<'a> {
    fn from(t: &'a Tensor<f32>) -> Input<'a> {
        Input::FloatTensor(t)
    }
}

impl<'a> From<&'a Tensor<i32>> for Input<'a> {
    fn from(t: &'a Tensor<i32>) -> Input<'a> {
        Input::IntTensor(t)
    }
}

/// Enum of the different types of output tensor that an operator can produce.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    FloatTensor(Tensor<f32>),
    IntTensor(Tensor<i32>),
}

impl Output {
    pub fn shape(&self) -> &[usize] {
        match self {
            Output::FloatTensor(t) => t.shape(),
            Output::IntTensor(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Output::FloatTensor(_) => DataType::Float,
            Output::IntTensor(_) => DataType::Int32,
        }
    }

    pub fn as_input(&self) -> Input<'_> {
        match self {
            Output::FloatTensor(t) => Input::FloatTensor(t),
            Output::IntTensor(t) => Input::IntTensor(t),
        }
    }

    pub fn as_float_ref(&self) -> Option<&Tensor<f32>> {
        match self {
            Output::FloatTensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int_ref(&self) -> Option<&Tensor<i32>> {
        match self {
            Output::IntTensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_float(self) -> Option<Tensor<f32>> {
        match self {
            Output::FloatTensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_int(self) -> Option<Tensor<i32>> {
        match self {
            Output::IntTensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Tensor<f32>> for Output {
    fn from(t: Tensor<f32>) -> Output {
        Output::FloatTensor(t)
    }
}

impl From<Tensor<i32>> for Output {
    fn from(t: Tensor<i32>) -> Output {
        Output::IntTensor(t)
    }
}

/// Reasons why an operator may fail when run.
#[derive(Clone, Debug, PartialEq)]
pub enum OpError {
    /// A required input was not provided.
    MissingInputs,

    /// An input had a type that is unsupported or mismatched with other
    /// inputs.
    WrongInputType,

    /// Input shapes are incompatible with each other or with the operator's
    /// attributes.
    IncompatibleInputShapes(&'static str),

    /// An input or attribute had an invalid value.
    InvalidValue(&'static str),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::MissingInputs => write!(f, "required inputs were missing"),
            OpError::WrongInputType => write!(f, "input tensor has unsupported type"),
            OpError::IncompatibleInputShapes(msg) => {
                write!(f, "incompatible input shapes: {}", msg)
            }
            OpError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
        }
    }
}

impl Error for OpError {}

/// List of inputs for an operator, in positional order.
///
/// Missing optional inputs are represented as `None` entries.
pub struct InputList<'a> {
    inputs: Vec<Option<Input<'a>>>,
}

impl<'a> InputList<'a> {
    pub fn from(inputs: &[Input<'a>]) -> InputList<'a> {
        InputList {
            inputs: inputs.iter().copied().map(Some).collect(),
        }
    }

    pub fn from_optional(inputs: Vec<Option<Input<'a>>>) -> InputList<'a> {
        InputList { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Input<'a>>> + '_ {
        self.inputs.iter().copied()
    }

    pub fn get(&self, index: usize) -> Option<Input<'a>> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn require(&self, index: usize) -> Result<Input<'a>, OpError> {
        self.get(index).ok_or(OpError::MissingInputs)
    }

    pub fn require_float(&self, index: usize) -> Result<&'a Tensor<f32>, OpError> {
        self.require(index)?
            .as_float()
            .ok_or(OpError::WrongInputType)
    }

    pub fn require_int(&self, index: usize) -> Result<&'a Tensor<i32>, OpError> {
        self.require(index)?
            .as_int()
            .ok_or(OpError::WrongInputType)
    }
}

/// Attribute value attached to an operator in the interchange document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Str(String),
}

/// Attribute map of an operator, keyed by attribute name.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Resolve an axis given as a possibly-negative offset into an index in
/// `0..ndim`.
pub fn resolve_axis(ndim: usize, axis: i32) -> Result<usize, OpError> {
    let resolved = if axis < 0 { axis + ndim as i32 } else { axis };
    if resolved < 0 || resolved >= ndim.max(1) as i32 {
        Err(OpError::InvalidValue("axis is out of range"))
    } else {
        Ok(resolved as usize)
    }
}

/// Source of a statically-known tensor value derived from shape metadata
/// alone.
///
/// Implemented by `Shape`-class operators so constant folding can
/// materialize their outputs when the input's dimensions are all fixed,
/// even though the input tensor itself is not a constant.
pub trait ShapeSource {
    /// Compute the operator's output from the dimension metadata of its
    /// input, or `None` if the metadata is not fully fixed.
    fn shape_value(&self, dims: &[Dimension]) -> Option<Tensor<i32>>;
}

/// An Operator is a computation step in a graph.
pub trait Operator: Debug {
    /// Return the operator's type name, eg. "Identity".
    fn name(&self) -> &str;

    /// Execute the operator with the given inputs.
    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError>;

    /// Attributes to serialize alongside the operator type in the
    /// interchange document.
    fn attributes(&self) -> Vec<(&'static str, AttrValue)> {
        Vec::new()
    }

    /// Capability hook for materializing this operator's output from static
    /// shape metadata. See [`ShapeSource`].
    fn as_shape_source(&self) -> Option<&dyn ShapeSource> {
        None
    }
}
