//! End-to-end tests for compiling and running graphs through the sessions.

use ember_core::{DType, EmberError, QuantParam, Tensor, TensorData};
use ember_edge::{CallBackParam, Context, LiteSession, Model, SessionMode, TensorDef, TrainSession};
use ember_kernels::{ConvParam, KernelKey, KernelMode, KernelRegistry, OpDesc, OpKind, OpParameter, PadMode, Target};

fn assert_close(a: &[f32], b: &[f32], tol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{msg}: length mismatch {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "{msg}: index {i}: {x} vs {y} (diff={})", (x - y).abs());
    }
}

const H: usize = 4;
const W: usize = 4;
const C_IN: usize = 2;
const C_OUT: usize = 3;

fn input_values() -> Vec<f32> {
    (0..H * W * C_IN).map(|i| ((i as f32) * 0.37).sin()).collect()
}

fn weight_values() -> Vec<f32> {
    (0..C_OUT * 9 * C_IN).map(|i| ((i as f32) * 0.11).cos() * 0.2).collect()
}

fn conv_node(x: usize, w: usize, y: usize) -> OpDesc {
    OpDesc {
        name: "conv".into(),
        op: OpKind::Conv2D,
        param: OpParameter::Conv(ConvParam::same(3, 1)),
        inputs: vec![x, w],
        outputs: vec![y],
    }
}

/// conv -> softmax cross-entropy, with the conv output declared as the graph output.
fn conv_loss_model() -> Model {
    let mut m = Model::new("conv_loss");
    let x = m.add_tensor(TensorDef::input("x", DType::Float32, &[1, H, W, C_IN]));
    let w = m.add_tensor(TensorDef::constant("w", &[C_OUT, 3, 3, C_IN], TensorData::Float32(weight_values())));
    let logits = m.add_tensor(TensorDef::var("logits", DType::Float32));
    let labels: Vec<f32> = (0..H * W * C_OUT).map(|i| if i % C_OUT == (i / C_OUT) % C_OUT { 1.0 } else { 0.0 }).collect();
    let labels = m.add_tensor(TensorDef::constant("labels", &[1, H, W, C_OUT], TensorData::Float32(labels)));
    let loss = m.add_tensor(TensorDef::var("loss", DType::Float32));
    m.add_node(conv_node(x, w, logits));
    m.add_node(OpDesc {
        name: "loss".into(),
        op: OpKind::SoftmaxCrossEntropy,
        param: OpParameter::SoftmaxCrossEntropy,
        inputs: vec![logits, labels],
        outputs: vec![loss],
    });
    m.inputs = vec![x];
    m.outputs = vec![logits];
    m
}

fn conv_only_model() -> Model {
    let mut m = Model::new("conv_only");
    let x = m.add_tensor(TensorDef::input("x", DType::Float32, &[1, H, W, C_IN]));
    let w = m.add_tensor(TensorDef::constant("w", &[C_OUT, 3, 3, C_IN], TensorData::Float32(weight_values())));
    let y = m.add_tensor(TensorDef::var("y", DType::Float32));
    m.add_node(conv_node(x, w, y));
    m.inputs = vec![x];
    m.outputs = vec![y];
    m
}

fn compiled_train_session(threads: usize) -> TrainSession {
    let mut session = TrainSession::create(Context::default().with_thread_num(threads)).unwrap();
    let mut registry = KernelRegistry::with_defaults();
    session.compile_train_graph(conv_loss_model(), &mut registry).unwrap();
    let x = session.inputs()[0];
    session.tensor_mut(x).unwrap().bind(TensorData::Float32(input_values())).unwrap();
    session
}

fn standalone_conv() -> Vec<f32> {
    let mut session = LiteSession::create(Context::default()).unwrap();
    session.compile_graph(conv_only_model(), &KernelRegistry::with_defaults()).unwrap();
    let x = session.inputs()[0];
    session.tensor_mut(x).unwrap().bind(TensorData::Float32(input_values())).unwrap();
    session.run_graph(None, None).unwrap();
    session.get_outputs_by_node_name("conv")[0].as_f32().unwrap().to_vec()
}

fn node_pairs(session: &TrainSession) -> Vec<(String, Vec<usize>)> {
    session.output_node_map().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

// ============================================================================
// Train / eval switching
// ============================================================================

#[test]
fn test_train_exposes_only_the_loss() {
    let mut session = compiled_train_session(2);
    assert_eq!(session.mode(), SessionMode::Train);
    session.run_graph(None, None).unwrap();

    assert_eq!(session.outputs().len(), 1);
    let losses = session.get_outputs_by_node_name("loss");
    assert_eq!(losses.len(), 1);
    let loss = losses[0].as_f32().unwrap();
    assert_eq!(loss.len(), 1);
    assert!(loss[0].is_finite() && loss[0] > 0.0, "loss = {}", loss[0]);
    assert!(session.get_outputs_by_node_name("conv").is_empty());
}

#[test]
fn test_eval_matches_standalone_conv() {
    for threads in [1, 3] {
        let mut session = compiled_train_session(threads);
        session.eval();
        session.run_graph(None, None).unwrap();

        assert_eq!(session.outputs().len(), 1);
        assert_eq!(session.output_node_map().keys().collect::<Vec<_>>(), vec!["conv"]);
        let out = session.get_outputs_by_node_name("conv")[0].as_f32().unwrap().to_vec();
        assert_close(&out, &standalone_conv(), 1e-6, &format!("eval conv, {threads} threads"));
    }
}

#[test]
fn test_eval_never_runs_the_loss_kernel() {
    let mut session = compiled_train_session(2);
    session.eval();
    let mut seen = Vec::new();
    let mut before = |_: &[&Tensor], _: &[&Tensor], p: &CallBackParam<'_>| -> bool {
        seen.push(p.node_type);
        true
    };
    session.run_graph(Some(&mut before), None).unwrap();
    assert_eq!(seen, vec![OpKind::Conv2D]);

    // The loss output keeps the zero fill it got when it was exposed.
    let loss_id = 4;
    assert_eq!(session.tensor(loss_id).unwrap().as_f32().unwrap(), &[0.0]);
}

#[test]
fn test_mode_round_trip_is_idempotent() {
    let mut session = compiled_train_session(2);
    let after_compile = node_pairs(&session);
    let tensors_after_compile = session.output_tensor_map().clone();

    session.eval();
    assert!(session.kernel_modes().iter().all(|&m| m == KernelMode::Eval));
    let eval_pairs = node_pairs(&session);
    session.train();
    assert!(session.kernel_modes().iter().all(|&m| m == KernelMode::Train));
    assert_eq!(node_pairs(&session), after_compile);
    assert_eq!(session.output_tensor_map(), &tensors_after_compile);

    session.eval();
    assert_eq!(node_pairs(&session), eval_pairs);
    session.eval();
    assert_eq!(node_pairs(&session), eval_pairs);
}

#[test]
fn test_train_after_eval_still_trains() {
    let mut session = compiled_train_session(1);
    session.eval();
    session.run_graph(None, None).unwrap();
    session.train();
    session.run_graph(None, None).unwrap();
    let loss = session.get_outputs_by_node_name("loss")[0].as_f32().unwrap()[0];
    assert!(loss > 0.0);
}

// ============================================================================
// Compilation
// ============================================================================

#[test]
fn test_registry_restored_after_success() {
    let mut registry = KernelRegistry::with_defaults();
    let before = registry.clone();
    let mut session = TrainSession::create(Context::default()).unwrap();
    session.compile_train_graph(conv_loss_model(), &mut registry).unwrap();

    assert_eq!(registry, before);
    let conv = registry.get_creator(&KernelKey::cpu(DType::Float32, OpKind::Conv2D)).unwrap();
    assert_eq!(conv.name, "conv_fp32");
}

#[test]
fn test_registry_restored_after_failure() {
    let mut registry = KernelRegistry::with_defaults();
    let before = registry.clone();

    let mut session = TrainSession::create(Context::default().with_target(Target::Gpu)).unwrap();
    let err = session.compile_train_graph(conv_loss_model(), &mut registry).unwrap_err();
    assert!(matches!(err, EmberError::Compilation(_)), "{err}");
    assert_eq!(registry, before);
    assert!(!session.is_compiled());
    assert!(matches!(session.run_graph(None, None), Err(EmberError::NotCompiled)));

    // Bad weight shape fails inside kernel init.
    let mut model = conv_loss_model();
    model.tensors[1] = TensorDef::constant("w", &[C_OUT, 3, 3, 5], TensorData::Float32(vec![0.0; C_OUT * 45]));
    let mut session = TrainSession::create(Context::default()).unwrap();
    assert!(session.compile_train_graph(model, &mut registry).is_err());
    assert_eq!(registry, before);
}

#[test]
fn test_workspace_sized_to_largest_kernel() {
    let session = compiled_train_session(2);
    // im2col buffer of the training conv: one row per output pixel.
    let expected = H * W * 9 * C_IN * std::mem::size_of::<f32>();
    assert_eq!(session.workspace_size(), expected);
}

#[test]
fn test_null_context() {
    let mut session = TrainSession::new();
    assert!(session.context().is_none());
    assert!(matches!(session.run_graph(None, None), Err(EmberError::NullContext)));
    let mut registry = KernelRegistry::with_defaults();
    assert!(matches!(
        session.compile_train_graph(conv_loss_model(), &mut registry),
        Err(EmberError::NullContext)
    ));
}

#[test]
fn test_export_keeps_weights() {
    let mut session = compiled_train_session(1);
    session.tensor_mut(1).unwrap().as_f32_mut().unwrap()[0] = 42.0;
    let buf = session.export_to_buffer().unwrap();
    let model = Model::from_buffer(&buf).unwrap();
    assert_eq!(model.nodes.len(), 2);
    match &model.tensors[1].data {
        Some(TensorData::Float32(w)) => assert_eq!(w[0], 42.0),
        other => panic!("weights not exported: {other:?}"),
    }
}

// ============================================================================
// Callbacks
// ============================================================================

#[test]
fn test_before_veto_and_after_abort() {
    let mut session = compiled_train_session(2);

    let mut veto_loss = |_: &[&Tensor], _: &[&Tensor], p: &CallBackParam<'_>| -> bool { p.node_type != OpKind::SoftmaxCrossEntropy };
    session.run_graph(Some(&mut veto_loss), None).unwrap();
    assert_eq!(session.get_outputs_by_node_name("loss")[0].as_f32().unwrap(), &[0.0]);
    assert_close(session.tensor(2).unwrap().as_f32().unwrap(), &standalone_conv(), 1e-6, "conv still ran");

    let mut session = compiled_train_session(2);
    let mut ran = Vec::new();
    let mut stop_after_conv = |_: &[&Tensor], _: &[&Tensor], p: &CallBackParam<'_>| -> bool {
        ran.push(p.node_name.to_string());
        false
    };
    session.run_graph(None, Some(&mut stop_after_conv)).unwrap();
    assert_eq!(ran, vec!["conv".to_string()]);
}

// ============================================================================
// Quantized Winograd through a session
// ============================================================================

fn int8_conv_model(param: ConvParam) -> Model {
    let (h, w, c_in, c_out) = (6, 5, 3, 4);
    let mut m = Model::new("int8_conv");
    let x = m.add_tensor(TensorDef::input("x", DType::Int8, &[1, h, w, c_in]).with_quant(vec![QuantParam::new(0.05, 3)]));
    let weights: Vec<i8> = (0..c_out * 9 * c_in).map(|i| ((i * 37) % 61) as i8 - 30).collect();
    let wt = m.add_tensor(
        TensorDef::constant("w", &[c_out, 3, 3, c_in], TensorData::Int8(weights)).with_quant(vec![QuantParam::new(0.02, 0)]),
    );
    let b = m.add_tensor(TensorDef::constant("b", &[c_out], TensorData::Int32(vec![10, -20, 0, 300])));
    let y = m.add_tensor(TensorDef::var("y", DType::Int8).with_quant(vec![QuantParam::new(0.1, -5)]));
    m.add_node(OpDesc {
        name: "qconv".into(),
        op: OpKind::Conv2D,
        param: OpParameter::Conv(param),
        inputs: vec![x, wt, b],
        outputs: vec![y],
    });
    m.inputs = vec![x];
    m.outputs = vec![y];
    m
}

fn run_int8(param: ConvParam, threads: usize) -> Vec<i8> {
    let mut session = LiteSession::create(Context::default().with_thread_num(threads)).unwrap();
    session.compile_graph(int8_conv_model(param), &KernelRegistry::with_defaults()).unwrap();
    let x = session.inputs()[0];
    let data: Vec<i8> = (0..6 * 5 * 3).map(|i| ((i * 53) % 255) as i32 - 128).map(|v| v as i8).collect();
    session.tensor_mut(x).unwrap().bind(TensorData::Int8(data)).unwrap();
    session.run_graph(None, None).unwrap();
    session.get_outputs_by_node_name("qconv")[0].as_i8().unwrap().to_vec()
}

#[test]
fn test_winograd_matches_direct_int8_conv() {
    // kernel size 0 is inferred from the weights and routed to the direct kernel.
    let direct = ConvParam { pad_mode: PadMode::Same, ..Default::default() };
    let reference = run_int8(direct, 1);
    assert_eq!(reference.len(), 6 * 5 * 4);
    for threads in [1, 2, 4] {
        assert_eq!(run_int8(ConvParam::same(3, 1), threads), reference, "threads = {threads}");
    }
}
