//! Code generation errors.

use crate::id::Id;
use kiln_graph::{DType, TensorError};

/// Errors produced while lowering a graph to a SPIR-V module.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// An element type the backend cannot represent on-device.
    #[error("element type {dtype} is not supported by the compute backend")]
    UnsupportedDType { dtype: DType },

    /// A node referenced a tensor that was never registered.
    #[error("node '{node}' references unknown tensor '{tensor}'")]
    UnknownTensor { node: String, tensor: String },

    /// A graph output was never produced by any node.
    #[error("graph output '{0}' is not produced by any node")]
    UnboundOutput(String),

    /// A call to a function id that was never defined.
    #[error("call to undefined function %{0}")]
    UnknownFunction(Id),

    /// A store was issued against a compile-time-constant tensor.
    #[error("tensor '{0}' is constant and cannot be written")]
    NotWritable(String),

    /// An instruction was emitted outside any open function body.
    #[error("instruction emitted outside a function body")]
    NoOpenFunction,

    #[error(transparent)]
    Tensor(#[from] TensorError),
}
