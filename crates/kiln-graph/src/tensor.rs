//! Tensor descriptors and constant tensor payloads.

use crate::dtype::DType;

/// Maximum tensor rank the generated kernels support.
///
/// The on-device tensor struct carries a fixed-length shape array of this
/// size, so the value is baked into the module's memory layout.
pub const MAX_RANK: usize = 6;

/// Errors raised by tensor payload operations.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// The operation requires at least rank 2.
    #[error("tensor '{name}' has rank {dims}, need at least 2")]
    RankTooLow { name: String, dims: usize },

    /// The payload operation is not implemented for this element type.
    #[error("tensor '{name}': {dtype} payloads are not supported")]
    UnsupportedDType { name: String, dtype: DType },

    /// Declared shape exceeds [`MAX_RANK`].
    #[error("tensor '{name}' has rank {dims}, max supported is {MAX_RANK}")]
    RankTooHigh { name: String, dims: usize },
}

/// Logical type of a tensor: name, element type, and concrete shape.
///
/// Dynamic axes must be resolved to concrete sizes before a `TensorType`
/// reaches the code generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorType {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u32>,
    /// Element buffer interpretation. Flipped by [`Tensor::transposed`];
    /// transposition is bookkeeping only and never permutes data.
    pub row_major: bool,
}

impl TensorType {
    /// Creates a row-major tensor type.
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            row_major: true,
        }
    }

    /// Number of dimensions.
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    /// Product of the declared shape. A rank-0 tensor holds one element.
    pub fn element_count(&self) -> u32 {
        self.shape.iter().product::<u32>().max(1)
    }
}

/// A constant tensor: a type plus its decoded element data.
///
/// Only single-precision float payloads are manipulated today; the loader
/// decodes little-endian raw buffers into `f32` before constructing one.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub ty: TensorType,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a constant tensor from decoded element data.
    pub fn new(ty: TensorType, data: Vec<f32>) -> Self {
        Self { ty, data }
    }

    /// Returns a transposed view of this tensor.
    ///
    /// Swaps the trailing two shape dimensions and flips the row-major
    /// flag. The element buffer is shared unchanged; read elements
    /// through [`Tensor::at`], which resolves the flipped order.
    pub fn transposed(&self) -> Result<Self, TensorError> {
        let dims = self.ty.dims();
        if dims < 2 {
            return Err(TensorError::RankTooLow {
                name: self.ty.name.clone(),
                dims,
            });
        }
        let mut ty = self.ty.clone();
        ty.shape.swap(dims - 2, dims - 1);
        ty.row_major = !ty.row_major;
        Ok(Self {
            ty,
            data: self.data.clone(),
        })
    }

    /// The element at a flat row-major position of the current shape.
    ///
    /// A transposed view keeps its buffer in the pre-transpose order, so
    /// the position is remapped through the trailing two extents before
    /// the buffer is read. Out-of-range positions read as zero.
    pub fn at(&self, index: usize) -> f32 {
        let dims = self.ty.dims();
        if self.ty.row_major || dims < 2 {
            return self.data.get(index).copied().unwrap_or(0.0);
        }
        let rows = self.ty.shape[dims - 2] as usize;
        let cols = self.ty.shape[dims - 1] as usize;
        let block = rows * cols;
        if block == 0 {
            return 0.0;
        }
        let base = index / block * block;
        let offset = index % block;
        let remapped = (offset % cols) * rows + offset / cols;
        self.data.get(base + remapped).copied().unwrap_or(0.0)
    }

    /// Multiplies every element by `factor` in place.
    pub fn scale(&mut self, factor: f32) -> Result<(), TensorError> {
        match self.ty.dtype {
            DType::Float => {
                for v in &mut self.data {
                    *v *= factor;
                }
                Ok(())
            }
            other => Err(TensorError::UnsupportedDType {
                name: self.ty.name.clone(),
                dtype: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: Vec<u32>, data: Vec<f32>) -> Tensor {
        Tensor::new(TensorType::new("t", DType::Float, shape), data)
    }

    #[test]
    fn element_count() {
        assert_eq!(TensorType::new("a", DType::Float, vec![4, 4]).element_count(), 16);
        assert_eq!(TensorType::new("b", DType::Float, vec![1, 4]).element_count(), 4);
        // rank 0 still holds a single element
        assert_eq!(TensorType::new("c", DType::Float, vec![]).element_count(), 1);
    }

    #[test]
    fn transpose_is_bookkeeping_only() {
        let t = tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let tt = t.transposed().unwrap();
        assert_eq!(tt.ty.shape, vec![3, 2]);
        assert!(!tt.ty.row_major);
        // data untouched
        assert_eq!(tt.data, t.data);
    }

    #[test]
    fn at_resolves_transposed_order() {
        let t = tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // row-major reads are direct
        assert_eq!(t.at(1), 2.0);
        let tt = t.transposed().unwrap();
        let flat: Vec<f32> = (0..6).map(|i| tt.at(i)).collect();
        // the [3, 2] view walks the original columns
        assert_eq!(flat, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn at_out_of_range_reads_zero() {
        let t = tensor(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.at(4), 0.0);
        assert_eq!(t.transposed().unwrap().at(4), 0.0);
    }

    #[test]
    fn transpose_rejects_vectors() {
        let t = tensor(vec![4], vec![0.0; 4]);
        assert!(matches!(
            t.transposed(),
            Err(TensorError::RankTooLow { dims: 1, .. })
        ));
    }

    #[test]
    fn scale_in_place() {
        let mut t = tensor(vec![1, 3], vec![1.0, -2.0, 0.5]);
        t.scale(2.0).unwrap();
        assert_eq!(t.data, vec![2.0, -4.0, 1.0]);
    }

    #[test]
    fn double_transpose_restores_shape() {
        let t = tensor(vec![2, 3], vec![0.0; 6]);
        let back = t.transposed().unwrap().transposed().unwrap();
        assert_eq!(back.ty.shape, vec![2, 3]);
        assert!(back.ty.row_major);
    }
}
