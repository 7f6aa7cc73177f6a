//! Graph description data model for kiln.
//!
//! A [`Graph`] is the compiler's input boundary: named external tensors,
//! plus operator nodes in source order. Callers (e.g. `kiln-onnx`) are
//! responsible for resolving dynamic axes and decoding constant tensor
//! payloads before a graph reaches the code generator.

mod dtype;
mod ops;
mod tensor;

pub use dtype::DType;
pub use ops::{GemmOp, Node, ReluOp};
pub use tensor::{Tensor, TensorError, TensorType, MAX_RANK};

/// A small inference graph: external inputs/outputs and operator nodes.
///
/// Nodes are kept in source order; the code generator compiles them in
/// exactly this order with no reordering.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// Model name, used for diagnostics only.
    pub name: String,
    /// Externally visible input tensors, in registration order.
    pub inputs: Vec<TensorType>,
    /// Externally visible output tensors, in registration order.
    pub outputs: Vec<TensorType>,
    /// Operator nodes in source order.
    pub nodes: Vec<Node>,
}

impl Graph {
    /// Creates an empty graph with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
