//! SPIR-V compute-shader code generation for kiln graphs.
//!
//! Lowers a [`kiln_graph::Graph`] into a textual SPIR-V module: one
//! `GLCompute` kernel function per operator node plus an entry kernel
//! that dispatches them in source order, synchronizing through workgroup
//! barriers where consecutive layers communicate via shared memory.
//!
//! The crate is organized around [`Program`], a single module-builder
//! context threaded through every emission call; there is no global
//! state, so independent compilations can run concurrently.

mod asm;
mod error;
mod ext;
mod flow;
mod id;
mod intern;
mod layout;
mod lower;
mod program;

pub use asm::{BinaryOp, BuiltIn, CmpOp, StorageClass};
pub use error::CompileError;
pub use flow::{ForLoop, IfBlock};
pub use id::{Id, IdAllocator};
pub use program::{FunctionHeader, Program, TensorMeta, LOCAL_SIZE};

use kiln_graph::Graph;
use tracing::info;

/// Compiles a graph into SPIR-V assembly text.
///
/// Inputs bind to descriptor set 0, outputs to set 1, each with
/// sequential binding indices in registration order. Nodes are lowered
/// in source order; intermediate tensors not registered as outputs
/// become workgroup-shared.
pub fn compile_graph(graph: &Graph) -> Result<String, CompileError> {
    info!(model = %graph.name, nodes = graph.nodes.len(), "compiling graph");
    for output in &graph.outputs {
        if !graph.nodes.iter().any(|node| node.output() == output.name) {
            return Err(CompileError::UnboundOutput(output.name.clone()));
        }
    }
    let mut program = Program::new();
    for input in &graph.inputs {
        program.add_input(input)?;
    }
    for output in &graph.outputs {
        program.add_output(output)?;
    }
    for node in &graph.nodes {
        program.add_node(node)?;
    }
    program.set_main()?;
    Ok(program.assemble())
}
