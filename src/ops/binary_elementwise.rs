use crate::op_registry::{Attrs, ReadOp, ReadOpError};
use crate::ops::{Input, InputList, OpError, Operator, Output};
use crate::tensor::Tensor;

/// Apply `op` elementwise to `a` and `b`.
///
/// The operands must have matching shapes, or one operand must be a single
/// element, which is broadcast against the other. Full multi-directional
/// broadcasting is not needed for the shape-arithmetic subgraphs this crate
/// folds.
fn binary_map<T: Copy, F: Fn(T, T) -> T>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    op: F,
) -> Result<Tensor<T>, OpError> {
    if a.shape() == b.shape() {
        let data = a.iter().zip(b.iter()).map(|(x, y)| op(x, y)).collect();
        Ok(Tensor::from_data(a.shape(), data))
    } else if b.len() == 1 {
        let y = b.data()[0];
        Ok(Tensor::from_data(
            a.shape(),
            a.iter().map(|x| op(x, y)).collect(),
        ))
    } else if a.len() == 1 {
        let x = a.data()[0];
        Ok(Tensor::from_data(
            b.shape(),
            b.iter().map(|y| op(x, y)).collect(),
        ))
    } else {
        Err(OpError::IncompatibleInputShapes(
            "operands must have matching shapes or a scalar operand",
        ))
    }
}

fn run_binary(
    inputs: InputList,
    float_op: fn(f32, f32) -> f32,
    int_op: fn(i32, i32) -> i32,
) -> Result<Vec<Output>, OpError> {
    let result = match (inputs.require(0)?, inputs.require(1)?) {
        (Input::FloatTensor(a), Input::FloatTensor(b)) => {
            Output::from(binary_map(a, b, float_op)?)
        }
        (Input::IntTensor(a), Input::IntTensor(b)) => Output::from(binary_map(a, b, int_op)?),
        _ => return Err(OpError::WrongInputType),
    };
    Ok(vec![result])
}

#[derive(Debug)]
pub struct Add {}

impl Operator for Add {
    fn name(&self) -> &str {
        "Add"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        run_binary(inputs, |x, y| x + y, |x, y| x.wrapping_add(y))
    }
}

impl ReadOp for Add {
    fn op_type() -> &'static str {
        "Add"
    }

    fn read(_attrs: &Attrs) -> Result<Add, ReadOpError> {
        Ok(Add {})
    }
}

#[derive(Debug)]
pub struct Mul {}

impl Operator for Mul {
    fn name(&self) -> &str {
        "Mul"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        run_binary(inputs, |x, y| x * y, |x, y| x.wrapping_mul(y))
    }
}

impl ReadOp for Mul {
    fn op_type() -> &'static str {
        "Mul"
    }

    fn read(_attrs: &Attrs) -> Result<Mul, ReadOpError> {
        Ok(Mul {})
    }
}
