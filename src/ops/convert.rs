use crate::op_registry::{require_str_attr, Attrs, ReadOp, ReadOpError};
use crate::ops::{AttrValue, DataType, Input, InputList, OpError, Operator, Output};

/// Convert a tensor to another element type.
///
/// Float to int conversion truncates toward zero.
#[derive(Debug)]
pub struct Cast {
    pub to: DataType,
}

impl Operator for Cast {
    fn name(&self) -> &str {
        "Cast"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let input = inputs.require(0)?;
        let result = match (input, self.to) {
            (Input::FloatTensor(t), DataType::Int32) => Output::from(t.map(|x| x as i32)),
            (Input::IntTensor(t), DataType::Float) => Output::from(t.map(|x| x as f32)),
            _ => input.to_output(),
        };
        Ok(vec![result])
    }

    fn attributes(&self) -> Vec<(&'static str, AttrValue)> {
        vec![("to", AttrValue::Str(self.to.name().to_string()))]
    }
}

impl ReadOp for Cast {
    fn op_type() -> &'static str {
        "Cast"
    }

    fn read(attrs: &Attrs) -> Result<Cast, ReadOpError> {
        let to = require_str_attr(attrs, "to")?;
        let to = DataType::from_name(to)
            .ok_or_else(|| ReadOpError::attr_error("to", "unknown data type"))?;
        Ok(Cast { to })
    }
}
