use smallvec::SmallVec;

use crate::op_registry::{require_int_attr, Attrs, ReadOp, ReadOpError};
use crate::ops::{resolve_axis, AttrValue, Input, InputList, OpError, Operator, Output};
use crate::tensor::Tensor;

fn concat<T: Copy>(inputs: &[&Tensor<T>], axis: usize) -> Result<Tensor<T>, OpError> {
    let first = inputs[0];
    if axis >= first.ndim() {
        return Err(OpError::InvalidValue("axis is out of range"));
    }
    for other in &inputs[1..] {
        let same_rank = other.ndim() == first.ndim();
        let dims_match = same_rank
            && other
                .shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(dim, (a, b))| dim == axis || a == b);
        if !dims_match {
            return Err(OpError::IncompatibleInputShapes(
                "inputs must match in all dimensions except the concatenation axis",
            ));
        }
    }

    let mut out_shape: SmallVec<[usize; 4]> = first.shape().into();
    out_shape[axis] = inputs.iter().map(|t| t.shape()[axis]).sum();

    let outer: usize = first.shape()[..axis].iter().product();
    let mut data = Vec::with_capacity(out_shape.iter().product());
    for chunk in 0..outer {
        for tensor in inputs {
            let block: usize = tensor.shape()[axis..].iter().product();
            data.extend_from_slice(&tensor.data()[chunk * block..(chunk + 1) * block]);
        }
    }
    Ok(Tensor::from_data(&out_shape, data))
}

/// Join tensors along an existing axis.
#[derive(Debug)]
pub struct Concat {
    pub axis: i32,
}

impl Operator for Concat {
    fn name(&self) -> &str {
        "Concat"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let first = inputs.require(0)?;
        let axis = resolve_axis(first.ndim(), self.axis)?;

        let result = match first {
            Input::FloatTensor(_) => {
                let tensors: Vec<&Tensor<f32>> = inputs
                    .iter()
                    .map(|input| {
                        input
                            .ok_or(OpError::MissingInputs)?
                            .as_float()
                            .ok_or(OpError::WrongInputType)
                    })
                    .collect::<Result<_, _>>()?;
                Output::from(concat(&tensors, axis)?)
            }
            Input::IntTensor(_) => {
                let tensors: Vec<&Tensor<i32>> = inputs
                    .iter()
                    .map(|input| {
                        input
                            .ok_or(OpError::MissingInputs)?
                            .as_int()
                            .ok_or(OpError::WrongInputType)
                    })
                    .collect::<Result<_, _>>()?;
                Output::from(concat(&tensors, axis)?)
            }
        };
        Ok(vec![result])
    }

    fn attributes(&self) -> Vec<(&'static str, AttrValue)> {
        vec![("axis", AttrValue::Int(self.axis as i64))]
    }
}

impl ReadOp for Concat {
    fn op_type() -> &'static str {
        "Concat"
    }

    fn read(attrs: &Attrs) -> Result<Concat, ReadOpError> {
        let axis = require_int_attr(attrs, "axis")?;
        Ok(Concat { axis: axis as i32 })
    }
}
