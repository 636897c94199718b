//! Dense tensor type
//!
//! This module provides the core `Tensor` type: an N-dimensional array with
//! row-major element storage. Every tensor exclusively owns its element
//! buffer; packing and export operations copy, never alias.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{EmpacarError, Result};

/// Dense N-dimensional tensor with row-major storage
///
/// The element count always equals the product of the shape dimensions.
/// A rank-0 tensor (empty shape) is a scalar holding exactly one element.
///
/// # Examples
///
/// ```
/// use empacar::Tensor;
///
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor; empty for scalars
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Arguments
    ///
    /// * `shape` - Dimensions of the tensor; empty for a scalar
    /// * `data` - Flattened data in row-major order
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape contains a zero dimension
    /// - Data length doesn't equal the product of the shape (1 for scalars)
    ///
    /// # Examples
    ///
    /// ```
    /// use empacar::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.contains(&0) {
            return Err(EmpacarError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }

        // Empty product is 1, so a rank-0 shape demands exactly one element.
        let expected_size: usize = shape.iter().product();

        if data.len() != expected_size {
            return Err(EmpacarError::DataShapeMismatch {
                data_size: data.len(),
                shape: shape.clone(),
                expected: expected_size,
            });
        }

        Ok(Self { data, shape })
    }

    /// Create a rank-0 (scalar) tensor
    ///
    /// # Examples
    ///
    /// ```
    /// use empacar::Tensor;
    ///
    /// let s = Tensor::scalar(3.5);
    /// assert_eq!(s.ndim(), 0);
    /// assert_eq!(s.size(), 1);
    /// ```
    #[must_use]
    pub fn scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Create a zero-filled tensor of the given shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape contains a zero dimension.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let size: usize = shape.iter().product();
        Self::from_vec(shape, vec![T::zero(); size])
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions (rank); 0 for scalars
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Consume the tensor and return its element buffer
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Flatten into a rank-1 tensor, preserving row-major element order
    #[must_use]
    pub fn into_flat(self) -> Self {
        let len = self.data.len();
        Self {
            data: self.data,
            shape: vec![len],
        }
    }
}

impl<T: Num + Clone + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}
