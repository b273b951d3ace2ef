use std::fmt;

/// A dense, row-major tensor.
///
/// Graph constants in a surgery tool are small (shape vectors, scalars,
/// stitched-in parameters), so this type favors simplicity over layout
/// tricks: the data is a plain `Vec` in logical order and reshapes copy
/// nothing.
#[derive(Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy> Tensor<T> {
    /// Create a tensor with a given shape and element data.
    ///
    /// Panics if the data length does not match the product of the shape.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "data length does not match shape {:?}",
            shape
        );
        Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Create a 1-D tensor from a vector of elements.
    pub fn from_vec(data: Vec<T>) -> Tensor<T> {
        Tensor {
            shape: vec![data.len()],
            data,
        }
    }

    /// Create a 0-D tensor holding a single value.
    pub fn from_scalar(value: T) -> Tensor<T> {
        Tensor {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Create a tensor with a given shape, filled with `value`.
    pub fn full(shape: &[usize], value: T) -> Tensor<T> {
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    /// Return the size of each dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Return the total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Return true if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the number of dimensions, aka. the rank.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the elements in logical order.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Return an iterator over elements in logical order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.data.iter().copied()
    }

    /// Consume the tensor and return its elements.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Return the single element of a 0-D or one-element tensor.
    pub fn item(&self) -> Option<T> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Return a copy of this tensor with a new shape.
    ///
    /// Panics if the new shape has a different element count.
    pub fn reshaped(&self, shape: &[usize]) -> Tensor<T> {
        Tensor::from_data(shape, self.data.clone())
    }

    /// Return a new tensor with each element transformed by `f`.
    pub fn map<U: Copy, F: Fn(T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data={:?})", self.shape, self.data)
    }
}

impl<T: Copy> From<Vec<T>> for Tensor<T> {
    fn from(data: Vec<T>) -> Tensor<T> {
        Tensor::from_vec(data)
    }
}

#[cfg(test)]
mod tests {
    use super::Tensor;

    #[test]
    fn test_from_data() {
        let t = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.len(), 6);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    #[should_panic(expected = "data length does not match shape")]
    fn test_from_data_length_mismatch() {
        Tensor::from_data(&[2, 3], vec![1, 2, 3]);
    }

    #[test]
    fn test_scalar() {
        let t = Tensor::from_scalar(42.0f32);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.len(), 1);
        assert_eq!(t.item(), Some(42.0));

        let v = Tensor::from_vec(vec![1, 2]);
        assert_eq!(v.item(), None);
    }

    #[test]
    fn test_reshaped() {
        let t = Tensor::from_vec(vec![1, 2, 3, 4]);
        let r = t.reshaped(&[2, 2]);
        assert_eq!(r.shape(), &[2, 2]);
        assert_eq!(r.data(), t.data());
    }

    #[test]
    fn test_map() {
        let t = Tensor::from_vec(vec![1i32, 2, 3]);
        let f = t.map(|x| x as f32 * 2.);
        assert_eq!(f.data(), &[2., 4., 6.]);
    }
}
