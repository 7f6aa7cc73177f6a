//! Tensor memory layout and access.
//!
//! Every tensor, whatever its storage class, shares one on-device struct
//! layout: field 0 is the rank (`dims`), field 1 a fixed-length shape
//! array of [`MAX_RANK`] extents, field 2 the flat element array. For
//! buffer-backed classes the struct carries explicit offsets (0, 4, 28)
//! and array strides, since the host reads the same bytes.
//!
//! Access paths differ by storage class:
//! - buffer tensors sit inside a single-field wrapper struct (the
//!   `Block`-decorated binding target), so chains start with an extra 0;
//! - workgroup and function-local tensors are indexed directly;
//! - compile-time-constant tensors are constant composites, which have
//!   no pointers; accesses first materialize a function-local copy of
//!   the needed field and index that.

use kiln_graph::{DType, Tensor, TensorType, MAX_RANK};
use tracing::trace;

use crate::asm::StorageClass;
use crate::error::CompileError;
use crate::id::Id;
use crate::program::{Program, TensorMeta};

/// Byte offset of the shape array (after the `dims` word).
const SHAPE_OFFSET: u32 = 4;
/// Byte offset of the element array (after `dims` + shape array).
const DATA_OFFSET: u32 = SHAPE_OFFSET + 4 * MAX_RANK as u32;

/// Struct field indices.
const FIELD_DIMS: u32 = 0;
const FIELD_SHAPE: u32 = 1;
const FIELD_DATA: u32 = 2;

impl Program {
    /// The on-device struct type for a tensor in the given storage class.
    ///
    /// With `reuse = false` a fresh definition is emitted even if a
    /// structurally equal one exists, so each binding target can carry
    /// its own decorations.
    pub(crate) fn add_tensor_type(
        &mut self,
        ty: &TensorType,
        storage: StorageClass,
        reuse: bool,
    ) -> Result<Id, CompileError> {
        let uint = self.uint_type();
        let elem = self.add_dtype(ty.dtype)?;
        let shape_array = self.add_array_type(uint, MAX_RANK as u32, 4, storage, reuse);
        let data_array = self.add_array_type(
            elem,
            ty.element_count(),
            ty.dtype.byte_width(),
            storage,
            reuse,
        );
        let id = self.add_struct_type(&[uint, shape_array, data_array], reuse);
        if storage.explicit_layout() {
            self.asm.push_member_offset(id, FIELD_DIMS, 0);
            self.asm.push_member_offset(id, FIELD_SHAPE, SHAPE_OFFSET);
            self.asm.push_member_offset(id, FIELD_DATA, DATA_OFFSET);
        }
        Ok(id)
    }

    /// Registers a workgroup-shared tensor, or returns the existing meta
    /// if the name is already taken (first registration wins, so a layer
    /// output that is also a graph output keeps its buffer backing).
    pub fn add_shared_tensor(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[u32],
    ) -> Result<TensorMeta, CompileError> {
        if let Some(meta) = self.tensor(name) {
            return Ok(meta.clone());
        }
        trace!(tensor = name, ?shape, "declaring workgroup tensor");
        let storage = StorageClass::Workgroup;
        let ty = TensorType::new(name, dtype, shape.to_vec());
        let struct_ty = self.add_tensor_type(&ty, storage, true)?;
        let var = self.add_var(struct_ty, storage, None)?;
        let elem = self.add_dtype(dtype)?;
        Ok(self.register_tensor(TensorMeta::variable(
            name.to_string(),
            dtype,
            storage,
            var,
            elem,
            shape.to_vec(),
        )))
    }

    /// Registers a compile-time-constant tensor as a constant composite,
    /// or returns the existing meta under the same name.
    pub fn add_const_tensor(&mut self, tensor: &Tensor) -> Result<TensorMeta, CompileError> {
        if let Some(meta) = self.tensor(&tensor.ty.name) {
            return Ok(meta.clone());
        }
        if tensor.ty.dtype != DType::Float {
            return Err(CompileError::UnsupportedDType {
                dtype: tensor.ty.dtype,
            });
        }
        trace!(tensor = %tensor.ty.name, elements = tensor.data.len(), "baking constant tensor");
        let storage = StorageClass::Constant;
        let uint = self.uint_type();
        let elem = self.add_dtype(tensor.ty.dtype)?;

        let dims_id = self.const_u32(tensor.ty.dims() as u32);

        let mut shape_elems = Vec::with_capacity(MAX_RANK);
        for i in 0..MAX_RANK {
            let extent = tensor.ty.shape.get(i).copied().unwrap_or(0);
            shape_elems.push(self.const_u32(extent));
        }
        let shape_array_type = self.add_array_type(uint, MAX_RANK as u32, 4, storage, true);
        let shape_id = self.add_composite_const(shape_array_type, shape_elems);

        // Bake elements in the row-major order of the tensor's current
        // shape; `Tensor::at` resolves transposed views.
        let count = tensor.ty.element_count() as usize;
        let mut data_elems = Vec::with_capacity(count);
        for i in 0..count {
            data_elems.push(self.const_f32(tensor.at(i)));
        }
        let data_array_type = self.add_array_type(elem, count as u32, 4, storage, true);
        let data_id = self.add_composite_const(data_array_type, data_elems);

        let struct_ty = self.add_tensor_type(&tensor.ty, storage, true)?;
        let composite = self.add_composite_const(struct_ty, vec![dims_id, shape_id, data_id]);

        Ok(self.register_tensor(TensorMeta {
            name: tensor.ty.name.clone(),
            dtype: tensor.ty.dtype,
            storage,
            id: composite,
            elem_type: elem,
            shape: tensor.ty.shape.clone(),
            dims_id,
            shape_id,
            data_id,
            shape_array_type,
            data_array_type,
        }))
    }

    /// A function-local variable initialized from a constant, memoized
    /// per function so each constant is copied at most once per kernel.
    fn const_local_copy(&mut self, copy_type: Id, constant: Id) -> Result<Id, CompileError> {
        let key = (self.current_function(), constant);
        if let Some(var) = self.const_copies.get(&key) {
            return Ok(*var);
        }
        let var = self.add_var(copy_type, StorageClass::Function, Some(constant))?;
        self.const_copies.insert(key, var);
        Ok(var)
    }

    /// Writes a tensor's rank field.
    pub fn store_tensor_dims(&mut self, meta: &TensorMeta, dims: u32) -> Result<(), CompileError> {
        if meta.storage == StorageClass::Constant {
            return Err(CompileError::NotWritable(meta.name.clone()));
        }
        let uint = self.uint_type();
        let ptr_ty = self.add_pointer_type(meta.storage, uint);
        let field = self.const_u32(FIELD_DIMS);
        let indices = if meta.storage.explicit_layout() {
            vec![field, field]
        } else {
            vec![field]
        };
        let chain = self.access_chain(ptr_ty, meta.id, &indices);
        let value = self.const_u32(dims);
        self.store_var(chain, value);
        Ok(())
    }

    /// Writes one extent of a tensor's shape array.
    pub fn store_tensor_shape_element(
        &mut self,
        meta: &TensorMeta,
        index: usize,
        extent: u32,
    ) -> Result<(), CompileError> {
        if meta.storage == StorageClass::Constant {
            return Err(CompileError::NotWritable(meta.name.clone()));
        }
        let uint = self.uint_type();
        let ptr_ty = self.add_pointer_type(meta.storage, uint);
        let field = self.const_u32(FIELD_SHAPE);
        let idx = self.const_u32(index as u32);
        let indices = if meta.storage.explicit_layout() {
            let wrap = self.const_u32(0);
            vec![wrap, field, idx]
        } else {
            vec![field, idx]
        };
        let chain = self.access_chain(ptr_ty, meta.id, &indices);
        let value = self.const_u32(extent);
        self.store_var(chain, value);
        Ok(())
    }

    /// Loads one extent of a tensor's shape array, memoized per function.
    /// Constant tensors resolve to the baked extent without a load.
    pub fn load_tensor_shape_element(
        &mut self,
        meta: &TensorMeta,
        index: usize,
    ) -> Result<Id, CompileError> {
        if meta.storage == StorageClass::Constant {
            let extent = meta.shape.get(index).copied().unwrap_or(0);
            return Ok(self.const_u32(extent));
        }
        let key = (self.current_function(), meta.id, index);
        if let Some(id) = self.shape_loads.get(&key) {
            return Ok(*id);
        }
        let uint = self.uint_type();
        let ptr_ty = self.add_pointer_type(meta.storage, uint);
        let field = self.const_u32(FIELD_SHAPE);
        let idx = self.const_u32(index as u32);
        let indices = if meta.storage.explicit_layout() {
            let wrap = self.const_u32(0);
            vec![wrap, field, idx]
        } else {
            vec![field, idx]
        };
        let chain = self.access_chain(ptr_ty, meta.id, &indices);
        let id = self.load_var(uint, chain);
        self.shape_loads.insert(key, id);
        Ok(id)
    }

    /// A typed pointer to the element at a flat index.
    fn tensor_element_ptr(&mut self, meta: &TensorMeta, index: Id) -> Result<Id, CompileError> {
        match meta.storage {
            StorageClass::Constant => {
                let copy = self.const_local_copy(meta.data_array_type, meta.data_id)?;
                let ptr_ty = self.add_pointer_type(StorageClass::Function, meta.elem_type);
                Ok(self.access_chain(ptr_ty, copy, &[index]))
            }
            storage if storage.explicit_layout() => {
                let ptr_ty = self.add_pointer_type(storage, meta.elem_type);
                let wrap = self.const_u32(0);
                let field = self.const_u32(FIELD_DATA);
                Ok(self.access_chain(ptr_ty, meta.id, &[wrap, field, index]))
            }
            storage => {
                let ptr_ty = self.add_pointer_type(storage, meta.elem_type);
                let field = self.const_u32(FIELD_DATA);
                Ok(self.access_chain(ptr_ty, meta.id, &[field, index]))
            }
        }
    }

    /// Loads the element at a flat index, memoized per function on
    /// (tensor, index) so repeated reads reuse one load.
    pub fn load_tensor_element(&mut self, meta: &TensorMeta, index: Id) -> Result<Id, CompileError> {
        let key = (self.current_function(), meta.id, index);
        if let Some(id) = self.element_loads.get(&key) {
            return Ok(*id);
        }
        let ptr = self.tensor_element_ptr(meta, index)?;
        let id = self.load_var(meta.elem_type, ptr);
        self.element_loads.insert(key, id);
        Ok(id)
    }

    /// Stores a value to the element at a flat index.
    pub fn store_tensor_element(
        &mut self,
        meta: &TensorMeta,
        index: Id,
        value: Id,
    ) -> Result<(), CompileError> {
        if meta.storage == StorageClass::Constant {
            return Err(CompileError::NotWritable(meta.name.clone()));
        }
        let ptr = self.tensor_element_ptr(meta, index)?;
        self.store_var(ptr, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::TensorType;

    #[test]
    fn buffer_tensor_struct_offsets() {
        let mut p = Program::new();
        let ty = TensorType::new("x", DType::Float, vec![4, 4]);
        p.add_input(&ty).unwrap();
        let text = p.assemble();
        assert!(text.contains("1 Offset 4"), "shape field at offset 4");
        assert!(text.contains("2 Offset 28"), "data field after 6-slot shape array");
        assert!(text.contains("ArrayStride 4"));
    }

    #[test]
    fn data_array_length_is_shape_product() {
        let mut p = Program::new();
        let ty = TensorType::new("x", DType::Float, vec![3, 5]);
        p.add_input(&ty).unwrap();
        let text = p.assemble();
        // the 15-element data array needs a length constant of 15
        assert!(text.contains("OpConstant") && text.contains(" 15\n"));
    }

    #[test]
    fn shared_tensor_carries_no_layout_decorations() {
        let mut p = Program::new();
        p.add_shared_tensor("h", DType::Float, &[4, 4]).unwrap();
        let text = p.assemble();
        assert!(text.contains("OpVariable") && text.contains("Workgroup"));
        assert!(!text.contains("Offset"));
        assert!(!text.contains("ArrayStride"));
    }

    #[test]
    fn shared_tensor_respects_first_registration() {
        let mut p = Program::new();
        p.add_output(&TensorType::new("y", DType::Float, vec![1, 4])).unwrap();
        let meta = p.add_shared_tensor("y", DType::Float, &[8, 8]).unwrap();
        // the buffer registration wins; no workgroup variable appears
        assert_eq!(meta.storage, StorageClass::StorageBuffer);
        assert_eq!(meta.shape, vec![1, 4]);
    }

    #[test]
    fn const_tensor_is_a_composite() {
        let mut p = Program::new();
        let t = Tensor::new(
            TensorType::new("w", DType::Float, vec![2, 2]),
            vec![1.0, 2.0, 3.0, 4.0],
        );
        let meta = p.add_const_tensor(&t).unwrap();
        assert_eq!(meta.storage, StorageClass::Constant);
        assert!(!meta.data_id.is_invalid());
        let text = p.assemble();
        assert_eq!(text.matches("OpConstantComposite").count(), 3);
    }

    #[test]
    fn const_tensor_bakes_transposed_views_row_major() {
        let mut p = Program::new();
        let t = Tensor::new(
            TensorType::new("w", DType::Float, vec![2, 2]),
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .transposed()
        .unwrap();
        p.add_const_tensor(&t).unwrap();
        let text = p.assemble();
        let defs: std::collections::HashMap<&str, &str> = text
            .lines()
            .filter_map(|line| {
                let (id, rest) = line.trim().split_once(" = OpConstant ")?;
                Some((id, rest.split(' ').nth(1)?))
            })
            .collect();
        let baked: Vec<Vec<&str>> = text
            .lines()
            .filter(|line| line.contains("OpConstantComposite"))
            .map(|line| {
                line.split(' ')
                    .skip(4)
                    .filter_map(|tok| defs.get(tok).copied())
                    .collect()
            })
            .collect();
        // the data composite holds the columns of the original matrix
        assert!(
            baked.iter().any(|vals| vals == &["1", "3", "2", "4"]),
            "composites: {baked:?}"
        );
    }

    #[test]
    fn const_tensor_rejects_stores() {
        let mut p = Program::new();
        let t = Tensor::new(TensorType::new("w", DType::Float, vec![1, 1]), vec![0.0]);
        let meta = p.add_const_tensor(&t).unwrap();
        assert!(matches!(
            p.store_tensor_dims(&meta, 2),
            Err(CompileError::NotWritable(_))
        ));
    }

    #[test]
    fn buffer_element_chain_is_wrapped_and_memoized() {
        let mut p = Program::new();
        p.add_input(&TensorType::new("x", DType::Float, vec![4, 4])).unwrap();
        let meta = p.tensor("x").unwrap().clone();
        p.begin_function();
        let idx = p.const_u32(3);
        let a = p.load_tensor_element(&meta, idx).unwrap();
        let b = p.load_tensor_element(&meta, idx).unwrap();
        p.end_function();
        assert_eq!(a, b);
        let text = p.assemble();
        // single chain, single load; first index selects the wrapper field
        assert_eq!(text.matches("OpAccessChain").count(), 1);
        assert_eq!(text.matches("OpLoad").count(), 1);
    }
}
