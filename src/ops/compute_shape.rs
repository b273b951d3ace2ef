use crate::graph::Dimension;
use crate::op_registry::{Attrs, ReadOp, ReadOpError};
use crate::ops::{InputList, OpError, Operator, Output, ShapeSource};
use crate::tensor::Tensor;

/// Produce the shape of the input as a 1-D int32 tensor.
///
/// The output depends only on the input's shape, so this operator can be
/// folded from static dimension metadata even when the input value itself is
/// not a constant. See [`ShapeSource`].
#[derive(Debug)]
pub struct Shape {}

impl Operator for Shape {
    fn name(&self) -> &str {
        "Shape"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let input = inputs.require(0)?;
        let dims: Vec<i32> = input.shape().iter().map(|&size| size as i32).collect();
        Ok(vec![Tensor::from_vec(dims).into()])
    }

    fn as_shape_source(&self) -> Option<&dyn ShapeSource> {
        Some(self)
    }
}

impl ShapeSource for Shape {
    fn shape_value(&self, dims: &[Dimension]) -> Option<Tensor<i32>> {
        let sizes: Option<Vec<i32>> = dims
            .iter()
            .map(|dim| match dim {
                Dimension::Fixed(size) => Some(*size as i32),
                Dimension::Symbolic(_) => None,
            })
            .collect();
        sizes.map(Tensor::from_vec)
    }
}

impl ReadOp for Shape {
    fn op_type() -> &'static str {
        "Shape"
    }

    fn read(_attrs: &Attrs) -> Result<Shape, ReadOpError> {
        Ok(Shape {})
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;
    use crate::graph::Dimension;
    use crate::ops::{InputList, Operator, ShapeSource};
    use crate::tensor::Tensor;

    #[test]
    fn test_shape() {
        let input = Tensor::<f32>::full(&[2, 3, 4], 0.);
        let result = Shape {}
            .run(InputList::from(&[(&input).into()]))
            .unwrap()
            .remove(0);
        let result = result.into_int().unwrap();
        assert_eq!(result.shape(), &[3]);
        assert_eq!(result.data(), &[2, 3, 4]);
    }

    #[test]
    fn test_shape_value_from_fixed_dims() {
        let op = Shape {};
        let dims = vec![Dimension::Fixed(1), Dimension::Fixed(3)];
        assert_eq!(
            op.shape_value(&dims).map(|t| t.into_vec()),
            Some(vec![1, 3])
        );

        let dims = vec![Dimension::Symbolic("batch".to_string()), Dimension::Fixed(3)];
        assert_eq!(op.shape_value(&dims), None);
    }
}
