//! Operator lowering: one kernel function per graph node.
//!
//! Each lowering opens a `void()` function, publishes the output
//! tensor's runtime metadata, guards against out-of-range invocations,
//! computes its element, and registers the function as a layer for the
//! entry-point driver. Row-major addressing throughout: the flat index
//! of `(row, column)` is `row * stride + column` with the stride taken
//! from the tensor's shape.

use kiln_graph::{DType, GemmOp, Node, ReluOp};
use tracing::debug;

use crate::asm::{BinaryOp, StorageClass};
use crate::error::CompileError;
use crate::id::Id;
use crate::program::{Program, TensorMeta};

impl Program {
    /// Lowers one graph node.
    pub fn add_node(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Gemm(op) => self.add_gemm(op),
            Node::Relu(op) => self.add_relu(op),
        }
    }

    /// `Y = alpha·op(A)·op(B) + beta·C`.
    ///
    /// The scalar attributes are folded at compile time: `alpha` into
    /// B's constant data and `beta` into C's, so the kernel performs no
    /// per-invocation scaling. Transposition is bookkeeping: it swaps
    /// the trailing shape extents and flips the majorness flag without
    /// permuting data, and the addressing below picks strides off the
    /// adjusted shapes.
    pub fn add_gemm(&mut self, op: &GemmOp) -> Result<(), CompileError> {
        debug!(node = %op.name, alpha = op.alpha, beta = op.beta, "lowering Gemm");
        let a = self.lookup_tensor(&op.name, &op.a)?;

        let mut b = if op.trans_b {
            op.b.transposed()?
        } else {
            op.b.clone()
        };
        b.scale(op.alpha)?;
        let mut c = op.c.clone();
        c.scale(op.beta)?;

        let rows = if op.trans_a {
            a.shape.get(1)
        } else {
            a.shape.get(0)
        }
        .copied()
        .unwrap_or(1);
        let cols = b.ty.shape.get(1).copied().unwrap_or(1);
        let y = self.add_shared_tensor(&op.y, a.dtype, &[rows, cols])?;

        let func = self.begin_function();
        let b_meta = self.add_const_tensor(&b)?;
        let c_meta = self.add_const_tensor(&c)?;

        // Publish Y's runtime metadata before any guard can return.
        self.store_tensor_dims(&y, 2)?;
        self.store_tensor_shape_element(&y, 0, rows)?;
        self.store_tensor_shape_element(&y, 1, cols)?;
        self.invocation_bounds_check(&y, 0)?;
        self.invocation_bounds_check(&y, 1)?;

        let elem = y.elem_type;
        let zero = self.const_zero(y.dtype)?;
        let acc = self.add_var(elem, StorageClass::Function, Some(zero))?;
        let (mul, add) = arithmetic_ops(y.dtype);

        let row = self.load_invocation_index(0);
        let col = self.load_invocation_index(1);

        // Reduction over the shared dimension. A's stride is its trailing
        // extent; under transA the roles of its two extents swap.
        let shared_axis = if op.trans_a { 0 } else { 1 };
        let bound = self.load_tensor_shape_element(&a, shared_axis)?;
        let a_stride = self.load_tensor_shape_element(&a, 1)?;
        let b_stride = self.load_tensor_shape_element(&b_meta, 1)?;

        let lp = self.begin_for(bound)?;
        let i = self.load_induction(&lp);
        let a_index = if op.trans_a {
            // op(A)[row, i] = A[i, row]
            self.flat_index(i, a_stride, row)
        } else {
            self.flat_index(row, a_stride, i)
        };
        let a_elem = self.load_tensor_element(&a, a_index)?;
        let b_index = self.flat_index(i, b_stride, col);
        let b_elem = self.load_tensor_element(&b_meta, b_index)?;
        let product = self.binary_op(mul, elem, a_elem, b_elem);
        let partial = self.load_var(elem, acc);
        let sum = self.binary_op(add, elem, partial, product);
        self.store_var(acc, sum);
        self.end_for(lp);

        // Bias and store at the invocation's output element. A
        // single-row C is reused for every output row, so its address
        // drops the row term.
        let y_stride = self.load_tensor_shape_element(&y, 1)?;
        let out_index = self.flat_index(row, y_stride, col);
        let bias_index = if bias_broadcasts_rows(&c_meta.shape) {
            col
        } else {
            out_index
        };
        let bias = self.load_tensor_element(&c_meta, bias_index)?;
        let total = self.load_var(elem, acc);
        let result = self.binary_op(add, elem, total, bias);
        self.store_tensor_element(&y, out_index, result)?;

        self.end_function();
        self.push_layer(func, workgroup_ids(&[&a, &y]));
        Ok(())
    }

    /// `Y = max(X, 0)` element-wise.
    pub fn add_relu(&mut self, op: &ReluOp) -> Result<(), CompileError> {
        debug!(node = %op.name, "lowering Relu");
        let x = self.lookup_tensor(&op.name, &op.x)?;
        if x.dtype != DType::Float {
            return Err(CompileError::UnsupportedDType { dtype: x.dtype });
        }
        let shape = x.shape.clone();
        let y = self.add_shared_tensor(&op.y, x.dtype, &shape)?;

        let func = self.begin_function();
        self.store_tensor_dims(&y, shape.len() as u32)?;
        for (axis, &extent) in shape.iter().enumerate() {
            self.store_tensor_shape_element(&y, axis, extent)?;
        }
        self.invocation_bounds_check(&y, 0)?;
        self.invocation_bounds_check(&y, 1)?;

        let row = self.load_invocation_index(0);
        let col = self.load_invocation_index(1);
        let stride = self.load_tensor_shape_element(&x, 1)?;
        let index = self.flat_index(row, stride, col);
        let value = self.load_tensor_element(&x, index)?;
        let zero = self.const_zero(x.dtype)?;
        let clamped = self.ext_max(x.elem_type, value, zero);
        self.store_tensor_element(&y, index, clamped)?;

        self.end_function();
        self.push_layer(func, workgroup_ids(&[&x, &y]));
        Ok(())
    }

    /// Row-major flat index `row * stride + column`.
    pub(crate) fn flat_index(&mut self, row: Id, stride: Id, column: Id) -> Id {
        let uint = self.uint_type();
        let scaled = self.binary_op(BinaryOp::IMul, uint, row, stride);
        self.binary_op(BinaryOp::IAdd, uint, scaled, column)
    }

    fn lookup_tensor(&self, node: &str, tensor: &str) -> Result<TensorMeta, CompileError> {
        self.tensor(tensor)
            .cloned()
            .ok_or_else(|| CompileError::UnknownTensor {
                node: node.to_string(),
                tensor: tensor.to_string(),
            })
    }
}

fn arithmetic_ops(dtype: DType) -> (BinaryOp, BinaryOp) {
    match dtype {
        DType::Float => (BinaryOp::FMul, BinaryOp::FAdd),
        _ => (BinaryOp::IMul, BinaryOp::IAdd),
    }
}

/// Whether a bias tensor holds a single row reused for every output
/// row (ONNX unidirectional broadcast, for the shapes accepted here).
fn bias_broadcasts_rows(shape: &[u32]) -> bool {
    match shape {
        [] | [_] => true,
        [rows, ..] => *rows <= 1,
    }
}

/// Ids of the tensors living in workgroup storage, for the layer
/// synchronization tracking consumed by the entry-point driver.
fn workgroup_ids(tensors: &[&TensorMeta]) -> Vec<Id> {
    tensors
        .iter()
        .filter(|meta| meta.storage == StorageClass::Workgroup)
        .map(|meta| meta.id)
        .collect()
}
