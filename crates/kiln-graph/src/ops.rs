//! Operator node definitions.

use crate::tensor::Tensor;

/// General matrix multiply with bias: `Y = alpha·op(A)·op(B) + beta·C`.
///
/// `A` and `Y` are referenced by name (they flow between layers); `B` and
/// `C` are constant tensors carried in the node, decoded by the loader.
/// See the ONNX Gemm operator for attribute semantics.
#[derive(Clone, Debug)]
pub struct GemmOp {
    /// Node name, for diagnostics.
    pub name: String,
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: bool,
    pub trans_b: bool,
    /// Name of the activation input tensor.
    pub a: String,
    /// Weight tensor (constant).
    pub b: Tensor,
    /// Bias tensor (constant).
    pub c: Tensor,
    /// Name of the output tensor.
    pub y: String,
}

/// Rectified linear unit: `Y = max(X, 0)` element-wise.
#[derive(Clone, Debug)]
pub struct ReluOp {
    /// Node name, for diagnostics.
    pub name: String,
    /// Name of the input tensor.
    pub x: String,
    /// Name of the output tensor.
    pub y: String,
}

/// An operator node. The set is closed; lowering matches exhaustively so
/// an unsupported operator is a compile-time-checked case.
#[derive(Clone, Debug)]
pub enum Node {
    Gemm(GemmOp),
    Relu(ReluOp),
}

impl Node {
    /// The node's name, for diagnostics.
    pub fn name(&self) -> &str {
        match self {
            Self::Gemm(op) => &op.name,
            Self::Relu(op) => &op.name,
        }
    }

    /// The name of the tensor this node produces.
    pub fn output(&self) -> &str {
        match self {
            Self::Gemm(op) => &op.y,
            Self::Relu(op) => &op.y,
        }
    }
}
