use smallvec::SmallVec;

use crate::op_registry::{require_ints_attr, Attrs, ReadOp, ReadOpError};
use crate::ops::{resolve_axis, AttrValue, Input, InputList, OpError, Operator, Output};

/// Compute the target shape for a reshape given the requested dimensions.
///
/// A `-1` entry is inferred from the remaining element count; a `0` entry
/// copies the input dimension at the same position.
fn resolve_target_shape(
    input_shape: &[usize],
    input_len: usize,
    request: &[i32],
) -> Result<Vec<usize>, OpError> {
    let mut wildcard_index = None;
    let mut known_product: usize = 1;
    let mut out_shape = Vec::with_capacity(request.len());

    for (index, &dim) in request.iter().enumerate() {
        let size = match dim {
            -1 => {
                if wildcard_index.is_some() {
                    return Err(OpError::InvalidValue(
                        "shape may contain at most one -1 entry",
                    ));
                }
                wildcard_index = Some(index);
                out_shape.push(0);
                continue;
            }
            0 => *input_shape
                .get(index)
                .ok_or(OpError::InvalidValue("no input dimension to copy"))?,
            size if size > 0 => size as usize,
            _ => return Err(OpError::InvalidValue("shape entries must be >= -1")),
        };
        known_product *= size;
        out_shape.push(size);
    }

    if let Some(index) = wildcard_index {
        if known_product == 0 || input_len % known_product != 0 {
            return Err(OpError::IncompatibleInputShapes(
                "input length is not divisible by the known dimensions",
            ));
        }
        out_shape[index] = input_len / known_product;
    } else if known_product != input_len {
        return Err(OpError::IncompatibleInputShapes(
            "new shape does not match input length",
        ));
    }
    Ok(out_shape)
}

/// Change a tensor's shape without changing its data.
///
/// Takes the data tensor and a 1-D int32 shape tensor as inputs.
#[derive(Debug)]
pub struct Reshape {}

impl Operator for Reshape {
    fn name(&self) -> &str {
        "Reshape"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let data = inputs.require(0)?;
        let shape = inputs.require_int(1)?;
        if shape.ndim() != 1 {
            return Err(OpError::InvalidValue("shape must be a vector"));
        }

        let request: Vec<i32> = shape.iter().collect();
        let out_shape = resolve_target_shape(data.shape(), data.len(), &request)?;

        let result = match data {
            Input::FloatTensor(t) => Output::from(t.reshaped(&out_shape)),
            Input::IntTensor(t) => Output::from(t.reshaped(&out_shape)),
        };
        Ok(vec![result])
    }
}

impl ReadOp for Reshape {
    fn op_type() -> &'static str {
        "Reshape"
    }

    fn read(_attrs: &Attrs) -> Result<Reshape, ReadOpError> {
        Ok(Reshape {})
    }
}

/// Insert size-1 dimensions at the given axes.
#[derive(Debug)]
pub struct Unsqueeze {
    pub axes: Vec<i32>,
}

impl Operator for Unsqueeze {
    fn name(&self) -> &str {
        "Unsqueeze"
    }

    fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
        let input = inputs.require(0)?;
        let out_ndim = input.ndim() + self.axes.len();

        let mut resolved: SmallVec<[usize; 4]> = SmallVec::new();
        for &axis in &self.axes {
            resolved.push(resolve_axis(out_ndim, axis)?);
        }
        resolved.sort_unstable();
        if resolved.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(OpError::InvalidValue("axes must be unique"));
        }

        let mut out_shape = Vec::with_capacity(out_ndim);
        let mut input_dims = input.shape().iter();
        for index in 0..out_ndim {
            if resolved.contains(&index) {
                out_shape.push(1);
            } else {
                // `resolved` has one entry per added dimension, so the
                // remaining slots exactly fit the input dims.
                out_shape.push(*input_dims.next().expect("should have an input dim"));
            }
        }

        let result = match input {
            Input::FloatTensor(t) => Output::from(t.reshaped(&out_shape)),
            Input::IntTensor(t) => Output::from(t.reshaped(&out_shape)),
        };
        Ok(vec![result])
    }

    fn attributes(&self) -> Vec<(&'static str, AttrValue)> {
        vec![(
            "axes",
            AttrValue::Ints(self.axes.iter().map(|&axis| axis as i64).collect()),
        )]
    }
}

impl ReadOp for Unsqueeze {
    fn op_type() -> &'static str {
        "Unsqueeze"
    }

    fn read(attrs: &Attrs) -> Result<Unsqueeze, ReadOpError> {
        let axes = require_ints_attr(attrs, "axes")?;
        Ok(Unsqueeze {
            axes: axes.iter().map(|&axis| axis as i32).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Reshape, Unsqueeze};
    use crate::ops::{InputList, OpError, Operator};
    use crate::tensor::Tensor;

    #[test]
    fn test_reshape() {
        let data = Tensor::from_vec(vec![1, 2, 3, 4, 5, 6]);
        let shape = Tensor::from_vec(vec![2, 3]);
        let result = Reshape {}
            .run(InputList::from(&[(&data).into(), (&shape).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.shape(), &[2, 3]);
    }

    #[test]
    fn test_reshape_with_wildcard() {
        let data = Tensor::<f32>::full(&[2, 6], 1.);
        let shape = Tensor::from_vec(vec![4, -1]);
        let result = Reshape {}
            .run(InputList::from(&[(&data).into(), (&shape).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.shape(), &[4, 3]);
    }

    #[test]
    fn test_reshape_copies_zero_dims() {
        let data = Tensor::<i32>::full(&[2, 6], 1);
        let shape = Tensor::from_vec(vec![0, 2, 3]);
        let result = Reshape {}
            .run(InputList::from(&[(&data).into(), (&shape).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.shape(), &[2, 2, 3]);
    }

    #[test]
    fn test_reshape_invalid() {
        let data = Tensor::from_vec(vec![1, 2, 3]);

        let shape = Tensor::from_vec(vec![2, 2]);
        let result = Reshape {}.run(InputList::from(&[(&data).into(), (&shape).into()]));
        assert!(matches!(
            result,
            Err(OpError::IncompatibleInputShapes(_))
        ));

        let shape = Tensor::from_vec(vec![-1, -1]);
        let result = Reshape {}.run(InputList::from(&[(&data).into(), (&shape).into()]));
        assert!(matches!(result, Err(OpError::InvalidValue(_))));
    }

    #[test]
    fn test_unsqueeze() {
        let input = Tensor::from_vec(vec![1, 2, 3]);
        let result = Unsqueeze { axes: vec![0, -1] }
            .run(InputList::from(&[(&input).into()]))
            .unwrap()
            .remove(0);
        assert_eq!(result.shape(), &[1, 3, 1]);
    }

    #[test]
    fn test_unsqueeze_duplicate_axes() {
        let input = Tensor::from_vec(vec![1, 2, 3]);
        let result = Unsqueeze { axes: vec![0, 0] }.run(InputList::from(&[(&input).into()]));
        assert_eq!(result, Err(OpError::InvalidValue("axes must be unique")));
    }
}
