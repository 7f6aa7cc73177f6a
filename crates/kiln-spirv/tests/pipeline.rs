//! End-to-end compilation checks over the emitted module text.

use kiln_graph::{DType, GemmOp, Graph, Node, ReluOp, Tensor, TensorType};
use kiln_spirv::compile_graph;

fn weight(name: &str, shape: Vec<u32>, data: Vec<f32>) -> Tensor {
    Tensor::new(TensorType::new(name, DType::Float, shape), data)
}

/// Map from scalar constant result id to its value token.
fn const_values(text: &str) -> std::collections::HashMap<&str, &str> {
    text.lines()
        .filter_map(|line| {
            let (id, rest) = line.trim().split_once(" = OpConstant ")?;
            Some((id, rest.split(' ').nth(1)?))
        })
        .collect()
}

/// Element value sequences of every constant composite, resolved through
/// the scalar constant definitions. Nested composite operands drop out.
fn composite_values(text: &str) -> Vec<Vec<&str>> {
    let defs = const_values(text);
    text.lines()
        .filter(|line| line.contains("OpConstantComposite"))
        .map(|line| {
            line.split(' ')
                .skip(4)
                .filter_map(|tok| defs.get(tok).copied())
                .collect()
        })
        .collect()
}

fn relu_graph() -> Graph {
    let mut graph = Graph::new("relu");
    graph
        .inputs
        .push(TensorType::new("x", DType::Float, vec![4, 4]));
    graph
        .outputs
        .push(TensorType::new("y", DType::Float, vec![4, 4]));
    graph.nodes.push(Node::Relu(ReluOp {
        name: "relu_0".into(),
        x: "x".into(),
        y: "y".into(),
    }));
    graph
}

fn gemm_relu_graph() -> Graph {
    let mut graph = Graph::new("mlp");
    graph
        .inputs
        .push(TensorType::new("x", DType::Float, vec![1, 4]));
    graph
        .outputs
        .push(TensorType::new("y", DType::Float, vec![1, 4]));
    graph.nodes.push(Node::Gemm(GemmOp {
        name: "gemm_0".into(),
        alpha: 1.0,
        beta: 1.0,
        trans_a: false,
        trans_b: false,
        a: "x".into(),
        b: weight("w0", vec![4, 4], (1..=16).map(|v| v as f32).collect()),
        c: weight("b0", vec![1, 4], vec![0.5; 4]),
        y: "h0".into(),
    }));
    graph.nodes.push(Node::Relu(ReluOp {
        name: "relu_0".into(),
        x: "h0".into(),
        y: "y".into(),
    }));
    graph
}

/// Every result id is defined exactly once, and every id used anywhere
/// is defined somewhere in the module.
#[test]
fn ids_are_unique_and_resolved() {
    let text = compile_graph(&gemm_relu_graph()).unwrap();
    let mut defined = std::collections::HashSet::new();
    for line in text.lines() {
        let line = line.trim_start();
        if let Some((result, _)) = line.split_once(" = ") {
            assert!(defined.insert(result.to_string()), "{result} defined twice");
        }
    }
    for token in text.split_whitespace().filter(|t| t.starts_with('%')) {
        assert!(defined.contains(token), "{token} used but never defined");
    }
}

#[test]
fn sections_follow_module_order() {
    let text = compile_graph(&relu_graph()).unwrap();
    let order = [
        "OpCapability Shader",
        "OpMemoryModel Logical GLSL450",
        "OpExtInstImport",
        "OpEntryPoint GLCompute",
        "OpExecutionMode",
        "OpDecorate",
        "OpTypeVoid",
        "OpFunction ",
    ];
    let mut last = 0;
    for needle in order {
        let pos = text.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(pos >= last, "{needle} out of order");
        last = pos;
    }
}

#[test]
fn each_type_is_defined_once() {
    let text = compile_graph(&gemm_relu_graph()).unwrap();
    assert_eq!(text.matches("OpTypeFloat 32").count(), 1);
    assert_eq!(text.matches("OpTypeInt 32 0").count(), 1);
    assert_eq!(text.matches("OpTypeBool").count(), 1);
    assert_eq!(text.matches("OpTypeVoid").count(), 1);
    assert_eq!(text.matches("OpExtInstImport").count(), 1);
}

#[test]
fn relu_scenario_single_kernel() {
    let text = compile_graph(&relu_graph()).unwrap();
    // kernel plus entry
    assert_eq!(text.matches("OpFunction %").count(), 2);
    assert_eq!(text.matches("OpFunctionCall").count(), 1);
    // two invocation-bounds guards
    assert_eq!(text.matches("OpSelectionMerge").count(), 2);
    assert_eq!(text.matches("OpUGreaterThan").count(), 2);
    // one elementwise max, one element store into the output buffer
    assert_eq!(text.matches("FMax").count(), 1);
    assert!(!text.contains("OpControlBarrier"));
}

#[test]
fn relu_scenario_loads_one_element() {
    let text = compile_graph(&relu_graph()).unwrap();
    // loads of float elements: exactly one (shape loads are uint)
    let float_ty = text
        .lines()
        .find(|l| l.contains("OpTypeFloat 32"))
        .and_then(|l| l.split(' ').next())
        .unwrap()
        .trim()
        .to_string();
    let elem_loads = text
        .lines()
        .filter(|l| l.contains("OpLoad") && l.contains(&format!("OpLoad {float_ty} ")))
        .count();
    assert_eq!(elem_loads, 1);
}

#[test]
fn gemm_alpha_scales_every_weight() {
    let mut graph = Graph::new("gemm");
    graph
        .inputs
        .push(TensorType::new("a", DType::Float, vec![1, 4]));
    graph
        .outputs
        .push(TensorType::new("y", DType::Float, vec![1, 4]));
    graph.nodes.push(Node::Gemm(GemmOp {
        name: "gemm_0".into(),
        alpha: 2.0,
        beta: 1.0,
        trans_a: false,
        trans_b: true,
        a: "a".into(),
        b: weight("w", vec![4, 4], (1..=16).map(|v| v as f32).collect()),
        c: weight("c", vec![1, 4], vec![1.0; 4]),
        y: "y".into(),
    }));
    let text = compile_graph(&graph).unwrap();
    // every weight doubled after transposition: 15 becomes 30
    assert!(text.contains("OpConstant") && text.contains(" 30\n"));
    assert!(text.contains(" 32\n"));
    // unscaled weight values must not appear as float constants
    let float_consts: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("OpConstant %"))
        .collect();
    assert!(!float_consts.iter().any(|l| l.ends_with(" 15")));
}

#[test]
fn gemm_trans_b_bakes_transposed_weights() {
    let mut graph = Graph::new("gemm");
    graph
        .inputs
        .push(TensorType::new("a", DType::Float, vec![1, 2]));
    graph
        .outputs
        .push(TensorType::new("y", DType::Float, vec![1, 2]));
    graph.nodes.push(Node::Gemm(GemmOp {
        name: "gemm_0".into(),
        alpha: 1.0,
        beta: 1.0,
        trans_a: false,
        trans_b: true,
        a: "a".into(),
        b: weight("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        c: weight("c", vec![1, 2], vec![0.0; 2]),
        y: "y".into(),
    }));
    let text = compile_graph(&graph).unwrap();
    let baked = composite_values(&text);
    // the weight composite holds the transposed matrix, not B's raw buffer
    assert!(
        baked.iter().any(|vals| vals == &["1", "3", "2", "4"]),
        "composites: {baked:?}"
    );
    assert!(!baked.iter().any(|vals| vals == &["1", "2", "3", "4"]));
}

#[test]
fn single_row_bias_broadcasts_down_rows() {
    let mut graph = Graph::new("gemm");
    graph
        .inputs
        .push(TensorType::new("a", DType::Float, vec![2, 2]));
    graph
        .outputs
        .push(TensorType::new("y", DType::Float, vec![2, 2]));
    graph.nodes.push(Node::Gemm(GemmOp {
        name: "gemm_0".into(),
        alpha: 1.0,
        beta: 1.0,
        trans_a: false,
        trans_b: false,
        a: "a".into(),
        b: weight("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        c: weight("c", vec![1, 2], vec![5.0, 6.0]),
        y: "y".into(),
    }));
    let text = compile_graph(&graph).unwrap();
    let defs = const_values(&text);

    // the function-local copy of the bias composite
    let c_composite = text
        .lines()
        .find(|l| {
            l.contains("OpConstantComposite")
                && l.split(' ')
                    .skip(4)
                    .filter_map(|tok| defs.get(tok).copied())
                    .collect::<Vec<_>>()
                    == ["5", "6"]
        })
        .and_then(|l| l.split(' ').next())
        .unwrap();
    let c_copy = text
        .lines()
        .find(|l| l.contains("OpVariable") && l.ends_with(&format!(" {c_composite}")))
        .map(|l| l.trim().split(' ').next().unwrap())
        .unwrap();

    // the invocation id's column component
    let builtin = text
        .lines()
        .find(|l| l.contains("BuiltIn GlobalInvocationId"))
        .and_then(|l| l.split(' ').nth(1))
        .unwrap();
    let uint_ty = text
        .lines()
        .find(|l| l.contains("OpTypeInt 32 0"))
        .and_then(|l| l.split(' ').next())
        .unwrap();
    let one = text
        .lines()
        .find(|l| l.ends_with(&format!("OpConstant {uint_ty} 1")))
        .and_then(|l| l.split(' ').next())
        .unwrap();
    let col_chain = text
        .lines()
        .find(|l| l.contains("OpAccessChain") && l.ends_with(&format!(" {builtin} {one}")))
        .map(|l| l.trim().split(' ').next().unwrap())
        .unwrap();
    let col = text
        .lines()
        .find(|l| l.ends_with(&format!("OpLoad {uint_ty} {col_chain}")))
        .map(|l| l.trim().split(' ').next().unwrap())
        .unwrap();

    // with a 2-row output, the bias address must be the column alone
    let bias_chain = text
        .lines()
        .find(|l| l.contains("OpAccessChain") && l.contains(&format!(" {c_copy} ")))
        .unwrap();
    assert!(
        bias_chain.ends_with(&format!(" {col}")),
        "bias chain should index by column: {bias_chain}"
    );
}

#[test]
fn gemm_relu_layers_synchronize_once() {
    let text = compile_graph(&gemm_relu_graph()).unwrap();
    assert_eq!(text.matches("OpControlBarrier").count(), 1);
    // the barrier sits between the two layer calls in the entry kernel
    let first_call = text.find("OpFunctionCall").unwrap();
    let barrier = text.find("OpControlBarrier").unwrap();
    let last_call = text.rfind("OpFunctionCall").unwrap();
    assert!(first_call < barrier && barrier < last_call);
}

#[test]
fn independent_layers_need_no_barrier() {
    // two Relus reading the same external input into two outputs share
    // no workgroup tensor, so the entry kernel emits no barrier
    let mut graph = Graph::new("fanout");
    graph
        .inputs
        .push(TensorType::new("x", DType::Float, vec![4, 4]));
    graph
        .outputs
        .push(TensorType::new("y0", DType::Float, vec![4, 4]));
    graph
        .outputs
        .push(TensorType::new("y1", DType::Float, vec![4, 4]));
    for (i, out) in ["y0", "y1"].iter().enumerate() {
        graph.nodes.push(Node::Relu(ReluOp {
            name: format!("relu_{i}"),
            x: "x".into(),
            y: (*out).into(),
        }));
    }
    let text = compile_graph(&graph).unwrap();
    assert_eq!(text.matches("OpFunctionCall").count(), 2);
    assert!(!text.contains("OpControlBarrier"));
}

#[test]
fn entry_interface_lists_buffers_and_builtin_once() {
    let text = compile_graph(&relu_graph()).unwrap();
    let entry = text
        .lines()
        .find(|l| l.starts_with("OpEntryPoint"))
        .unwrap();
    let vars: Vec<&str> = entry.split(' ').filter(|t| t.starts_with('%')).collect();
    // main + input + output + invocation builtin, no duplicates
    let mut unique = vars.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(vars.len(), unique.len());
    assert_eq!(vars.len(), 4);
    assert!(text.contains("LocalSize 4 4 1"));
}

#[test]
fn unbound_output_is_rejected() {
    let mut graph = relu_graph();
    graph
        .outputs
        .push(TensorType::new("z", DType::Float, vec![4, 4]));
    let err = compile_graph(&graph).unwrap_err();
    assert!(matches!(
        err,
        kiln_spirv::CompileError::UnboundOutput(ref name) if name == "z"
    ));
}

#[test]
fn unsupported_dtype_surfaces_as_error() {
    let mut graph = relu_graph();
    graph.inputs[0].dtype = DType::Float16;
    assert!(compile_graph(&graph).is_err());
}
