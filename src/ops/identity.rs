use crate::op_registry::{Attrs, ReadOp, ReadOpError};
use crate::ops::{InputList, OpError, Operator, Output};

/// Passthrough operator that forwards its single input unchanged.
///
/// Stitching inserts these to bridge the outputs of one graph to the inputs
/// of another.
#[derive(Debug)]
pub struct Identity {}

impl Operator for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let input = inputs.require(0)?;
        Ok(vec![input.to_output()])
    }
}

impl ReadOp for Identity {
    fn op_type() -> &'static str {
        "Identity"
    }

    fn read(_attrs: &Attrs) -> Result<Identity, ReadOpError> {
        Ok(Identity {})
    }
}

#[cfg(test)]
mod tests {
    use super::Identity;
    use crate::ops::{InputList, Operator};
    use crate::tensor::Tensor;

    #[test]
    fn test_identity() {
        let op = Identity {};

        let int_input = Tensor::from_vec(vec![1, 2, 3]);
        let result = op
            .run(InputList::from(&[(&int_input).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.into_int().unwrap(), int_input);

        let float_input = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
        let result = op
            .run(InputList::from(&[(&float_input).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.into_float().unwrap(), float_input);
    }
}
