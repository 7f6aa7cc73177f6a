//! ONNX model loading for kiln.
//!
//! Decodes a serialized ONNX model, resolves named dynamic axes to
//! concrete sizes, decodes initializer payloads, and produces the
//! [`kiln_graph::Graph`] the code generator consumes. Only the operator
//! subset the backend lowers (Gemm, Relu) is accepted; anything else is
//! rejected up front with the offending operator named.

pub mod proto;

use std::collections::HashMap;
use std::path::Path;

use prost::Message;

use kiln_graph::{DType, GemmOp, Graph, Node, ReluOp, Tensor, TensorType};
use proto::{DimensionValue, ModelProto, NodeProto, TensorProto, ValueInfoProto};

/// Errors raised while loading a model.
#[derive(Debug, thiserror::Error)]
pub enum OnnxError {
    #[error("failed to read model file")]
    Io(#[from] std::io::Error),

    #[error("failed to decode model protobuf")]
    Decode(#[from] prost::DecodeError),

    #[error("model carries no graph")]
    MissingGraph,

    #[error("node '{node}' has unsupported op type '{op}'")]
    UnsupportedOp { node: String, op: String },

    #[error("tensor '{tensor}' has unrecognized element type code {code}")]
    UnknownDType { tensor: String, code: i32 },

    #[error("tensor '{tensor}' carries no tensor type")]
    MissingType { tensor: String },

    #[error("initializer '{tensor}' has element type {dtype}, only f32 weights are supported")]
    UnsupportedInitializer { tensor: String, dtype: DType },

    #[error("tensor '{tensor}' axis '{axis}' is dynamic; resolve it with --set-axis")]
    UnresolvedAxis { tensor: String, axis: String },

    #[error("tensor '{tensor}' has non-positive extent {extent}")]
    BadExtent { tensor: String, extent: i64 },

    #[error("node '{node}' input '{tensor}' is not an initializer")]
    MissingInitializer { node: String, tensor: String },

    #[error("node '{node}' expects {expected} inputs, has {actual}")]
    ArityMismatch {
        node: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{tensor}' raw data length {len} is not a whole number of elements")]
    RaggedRawData { tensor: String, len: usize },
}

/// Reads and decodes a model file.
pub fn load_model(path: &Path) -> Result<ModelProto, OnnxError> {
    let bytes = std::fs::read(path)?;
    Ok(ModelProto::decode(bytes.as_slice())?)
}

/// Converts a decoded model into a backend graph.
///
/// `axes` maps dynamic axis names (e.g. `batch_size`) to concrete sizes;
/// every dynamic axis appearing in an input or output must be covered.
pub fn build_graph(model: &ModelProto, axes: &HashMap<String, u32>) -> Result<Graph, OnnxError> {
    let gp = model.graph.as_ref().ok_or(OnnxError::MissingGraph)?;
    let initializers: HashMap<&str, &TensorProto> = gp
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    let mut graph = Graph::new(&gp.name);
    for input in &gp.input {
        // initializers are listed among graph inputs; they are constants,
        // not externally bound buffers
        if initializers.contains_key(input.name.as_str()) {
            continue;
        }
        graph.inputs.push(tensor_type(input, axes)?);
    }
    for output in &gp.output {
        graph.outputs.push(tensor_type(output, axes)?);
    }
    for node in &gp.node {
        graph.nodes.push(convert_node(node, &initializers)?);
    }
    Ok(graph)
}

fn convert_node(
    node: &NodeProto,
    initializers: &HashMap<&str, &TensorProto>,
) -> Result<Node, OnnxError> {
    let name = if node.name.is_empty() {
        format!("{}_{}", node.op_type.to_lowercase(), node.output.first().map(String::as_str).unwrap_or(""))
    } else {
        node.name.clone()
    };
    match node.op_type.as_str() {
        "Gemm" => {
            require_arity(node, &name, 3)?;
            let b = initializer_tensor(&name, &node.input[1], initializers)?;
            let c = initializer_tensor(&name, &node.input[2], initializers)?;
            Ok(Node::Gemm(GemmOp {
                name,
                alpha: attr_f(node, "alpha", 1.0),
                beta: attr_f(node, "beta", 1.0),
                trans_a: attr_i(node, "transA", 0) != 0,
                trans_b: attr_i(node, "transB", 0) != 0,
                a: node.input[0].clone(),
                b,
                c,
                y: node.output[0].clone(),
            }))
        }
        "Relu" => {
            require_arity(node, &name, 1)?;
            Ok(Node::Relu(ReluOp {
                name,
                x: node.input[0].clone(),
                y: node.output[0].clone(),
            }))
        }
        other => Err(OnnxError::UnsupportedOp {
            node: name,
            op: other.to_string(),
        }),
    }
}

fn require_arity(node: &NodeProto, name: &str, expected: usize) -> Result<(), OnnxError> {
    if node.input.len() < expected || node.output.is_empty() {
        return Err(OnnxError::ArityMismatch {
            node: name.to_string(),
            expected,
            actual: node.input.len(),
        });
    }
    Ok(())
}

fn attr_f(node: &NodeProto, name: &str, default: f32) -> f32 {
    node.attribute
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.f)
        .unwrap_or(default)
}

fn attr_i(node: &NodeProto, name: &str, default: i64) -> i64 {
    node.attribute
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.i)
        .unwrap_or(default)
}

fn initializer_tensor(
    node: &str,
    name: &str,
    initializers: &HashMap<&str, &TensorProto>,
) -> Result<Tensor, OnnxError> {
    let proto = initializers
        .get(name)
        .ok_or_else(|| OnnxError::MissingInitializer {
            node: node.to_string(),
            tensor: name.to_string(),
        })?;
    decode_tensor(proto)
}

/// Decodes an initializer's payload into typed elements.
///
/// Exporters store weights either as packed `float_data` or as a raw
/// little-endian byte buffer; both are accepted.
pub fn decode_tensor(proto: &TensorProto) -> Result<Tensor, OnnxError> {
    let dtype = DType::from_onnx(proto.data_type).ok_or(OnnxError::UnknownDType {
        tensor: proto.name.clone(),
        code: proto.data_type,
    })?;
    if dtype != DType::Float {
        return Err(OnnxError::UnsupportedInitializer {
            tensor: proto.name.clone(),
            dtype,
        });
    }
    let mut shape = Vec::with_capacity(proto.dims.len());
    for &dim in &proto.dims {
        if dim <= 0 {
            return Err(OnnxError::BadExtent {
                tensor: proto.name.clone(),
                extent: dim,
            });
        }
        shape.push(dim as u32);
    }
    let data = if !proto.float_data.is_empty() {
        proto.float_data.clone()
    } else {
        if proto.raw_data.len() % 4 != 0 {
            return Err(OnnxError::RaggedRawData {
                tensor: proto.name.clone(),
                len: proto.raw_data.len(),
            });
        }
        proto
            .raw_data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    };
    Ok(Tensor::new(
        TensorType::new(&proto.name, dtype, shape),
        data,
    ))
}

fn tensor_type(
    info: &ValueInfoProto,
    axes: &HashMap<String, u32>,
) -> Result<TensorType, OnnxError> {
    let tt = info
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .ok_or_else(|| OnnxError::MissingType {
            tensor: info.name.clone(),
        })?;
    let dtype = DType::from_onnx(tt.elem_type).ok_or(OnnxError::UnknownDType {
        tensor: info.name.clone(),
        code: tt.elem_type,
    })?;
    let mut shape = Vec::new();
    if let Some(dims) = &tt.shape {
        for dim in &dims.dim {
            let extent = match &dim.value {
                Some(DimensionValue::DimValue(v)) if *v > 0 => *v as u32,
                Some(DimensionValue::DimValue(v)) => {
                    return Err(OnnxError::BadExtent {
                        tensor: info.name.clone(),
                        extent: *v,
                    })
                }
                Some(DimensionValue::DimParam(param)) => {
                    axes.get(param)
                        .copied()
                        .ok_or_else(|| OnnxError::UnresolvedAxis {
                            tensor: info.name.clone(),
                            axis: param.clone(),
                        })?
                }
                None => {
                    return Err(OnnxError::UnresolvedAxis {
                        tensor: info.name.clone(),
                        axis: "?".to_string(),
                    })
                }
            };
            shape.push(extent);
        }
    }
    Ok(TensorType::new(&info.name, dtype, shape))
}
