use std::error::Error;
use std::fmt::{Display, Formatter};

use rustc_hash::FxHashMap;

pub use crate::ops::Attrs;
use crate::ops::{
    Add, AttrValue, Cast, Concat, Identity, Mul, Operator, Reshape, Shape, Unsqueeze,
};

/// Error type for errors that occur when de-serializing an operator.
#[derive(Debug, PartialEq)]
pub enum ReadOpError {
    /// An attribute is missing, has the wrong type or an invalid value.
    AttrError {
        /// Name of the attribute.
        attr: String,
        /// Description of the attribute error.
        error: String,
    },
    /// The operator is not registered.
    OperatorUnavailable {
        /// Type name of the operator.
        name: String,
    },
}

impl ReadOpError {
    pub(crate) fn attr_error(attr: impl AsRef<str>, error: impl AsRef<str>) -> ReadOpError {
        ReadOpError::AttrError {
            attr: attr.as_ref().to_string(),
            error: error.as_ref().to_string(),
        }
    }
}

impl Display for ReadOpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOpError::AttrError { attr, error } => {
                write!(f, "error in attribute \"{}\": {}", attr, error)
            }
            ReadOpError::OperatorUnavailable { name } => {
                write!(f, "operator {} is not registered", name)
            }
        }
    }
}

impl Error for ReadOpError {}

pub(crate) fn require_int_attr(attrs: &Attrs, name: &str) -> Result<i64, ReadOpError> {
    match attrs.get(name) {
        Some(AttrValue::Int(value)) => Ok(*value),
        Some(_) => Err(ReadOpError::attr_error(name, "expected an int")),
        None => Err(ReadOpError::attr_error(name, "attribute is missing")),
    }
}

pub(crate) fn require_ints_attr<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a [i64], ReadOpError> {
    match attrs.get(name) {
        Some(AttrValue::Ints(values)) => Ok(values),
        Some(_) => Err(ReadOpError::attr_error(name, "expected a list of ints")),
        None => Err(ReadOpError::attr_error(name, "attribute is missing")),
    }
}

pub(crate) fn require_str_attr<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a str, ReadOpError> {
    match attrs.get(name) {
        Some(AttrValue::Str(value)) => Ok(value),
        Some(_) => Err(ReadOpError::attr_error(name, "expected a string")),
        None => Err(ReadOpError::attr_error(name, "attribute is missing")),
    }
}

/// Deserialize an operator of one type from its interchange attributes.
pub trait ReadOp: Operator {
    /// The operator type name used in interchange documents.
    fn op_type() -> &'static str;

    /// Construct the operator from an attribute map.
    fn read(attrs: &Attrs) -> Result<Self, ReadOpError>
    where
        Self: Sized;
}

type OpCtor = fn(&Attrs) -> Result<Box<dyn Operator + Send + Sync>, ReadOpError>;

fn read_op<Op: ReadOp + Send + Sync + 'static>(
    attrs: &Attrs,
) -> Result<Box<dyn Operator + Send + Sync>, ReadOpError> {
    Op::read(attrs).map(|op| Box::new(op) as Box<dyn Operator + Send + Sync>)
}

/// Registry used to deserialize operators when importing a model.
///
/// New registries have no operators registered. Use
/// [`OpRegistry::with_all_ops`] for a registry with every built-in operator,
/// or [`OpRegistry::register_op`] to register operators selectively,
/// including custom implementations registered under a built-in type name.
#[derive(Default)]
pub struct OpRegistry {
    ops: FxHashMap<&'static str, OpCtor>,
}

impl OpRegistry {
    /// Create a new empty registry.
    pub fn new() -> OpRegistry {
        OpRegistry::default()
    }

    /// Register an operator type.
    ///
    /// Replaces any existing registration for the same type name.
    pub fn register_op<Op: ReadOp + Send + Sync + 'static>(&mut self) {
        self.ops.insert(Op::op_type(), read_op::<Op>);
    }

    /// Return true if an operator type is registered.
    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    /// Instantiate an operator from its type name and attributes.
    pub fn create(
        &self,
        op_type: &str,
        attrs: &Attrs,
    ) -> Result<Box<dyn Operator + Send + Sync>, ReadOpError> {
        match self.ops.get(op_type) {
            Some(ctor) => ctor(attrs),
            None => Err(ReadOpError::OperatorUnavailable {
                name: op_type.to_string(),
            }),
        }
    }

    /// Create a new registry with all built-in operators registered.
    pub fn with_all_ops() -> OpRegistry {
        let mut reg = OpRegistry::new();
        reg.register_op::<Add>();
        reg.register_op::<Cast>();
        reg.register_op::<Concat>();
        reg.register_op::<Identity>();
        reg.register_op::<Mul>();
        reg.register_op::<Reshape>();
        reg.register_op::<Shape>();
        reg.register_op::<Unsqueeze>();
        reg
    }
}
