//! Ember Edge benchmark: train and eval passes over a conv -> loss graph,
//! plus the int8 Winograd convolution on its own.
//!
//! Usage: cargo run --example bench_edge -p ember-edge --release

use std::time::Instant;

use ember_core::{DType, QuantParam, TensorData};
use ember_edge::{Context, LiteSession, Model, TensorDef, TrainSession};
use ember_kernels::{ConvParam, KernelRegistry, OpDesc, OpKind, OpParameter};

fn main() -> ember_core::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Ember Edge Benchmark ===");
    println!();

    let configs = [("tiny", 8, 4, 4), ("small", 32, 16, 16), ("medium", 64, 32, 32)];
    let iters = 10;

    for (name, hw, c_in, c_out) in configs {
        let mut session = TrainSession::create(Context::default().with_thread_num(4))?;
        session.compile_train_graph(fp32_model(hw, c_in, c_out), &mut KernelRegistry::with_defaults())?;
        let x = session.inputs()[0];
        let data: Vec<f32> = (0..hw * hw * c_in).map(|i| ((i as f32) * 0.013).sin()).collect();
        if let Some(t) = session.tensor_mut(x) {
            t.bind(TensorData::Float32(data))?;
        }

        session.run_graph(None, None)?;
        let start = Instant::now();
        for _ in 0..iters {
            session.run_graph(None, None)?;
        }
        let train_ms = start.elapsed().as_secs_f64() * 1000.0 / iters as f64;

        session.eval();
        let start = Instant::now();
        for _ in 0..iters {
            session.run_graph(None, None)?;
        }
        let eval_ms = start.elapsed().as_secs_f64() * 1000.0 / iters as f64;

        let int8_ms = bench_int8(hw, c_in, c_out, iters)?;

        println!(
            "{:<8} {}x{}x{}->{} | train {:.3}ms | eval {:.3}ms | int8 winograd {:.3}ms | workspace {} B",
            name,
            hw,
            hw,
            c_in,
            c_out,
            train_ms,
            eval_ms,
            int8_ms,
            session.workspace_size()
        );
    }

    println!();
    println!("Done.");
    Ok(())
}

fn fp32_model(hw: usize, c_in: usize, c_out: usize) -> Model {
    let mut m = Model::new("bench_fp32");
    let x = m.add_tensor(TensorDef::input("x", DType::Float32, &[1, hw, hw, c_in]));
    let w: Vec<f32> = (0..c_out * 9 * c_in).map(|i| ((i as f32) * 0.7).cos() * 0.05).collect();
    let w = m.add_tensor(TensorDef::constant("w", &[c_out, 3, 3, c_in], TensorData::Float32(w)));
    let logits = m.add_tensor(TensorDef::var("logits", DType::Float32));
    let labels: Vec<f32> = (0..hw * hw * c_out).map(|i| if i % c_out == 0 { 1.0 } else { 0.0 }).collect();
    let labels = m.add_tensor(TensorDef::constant("labels", &[1, hw, hw, c_out], TensorData::Float32(labels)));
    let loss = m.add_tensor(TensorDef::var("loss", DType::Float32));
    m.add_node(OpDesc {
        name: "conv".into(),
        op: OpKind::Conv2D,
        param: OpParameter::Conv(ConvParam::same(3, 1)),
        inputs: vec![x, w],
        outputs: vec![logits],
    });
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

fn bench_int8(hw: usize, c_in: usize, c_out: usize, iters: usize) -> ember_core::Result<f64> {
    let mut m = Model::new("bench_int8");
    let x = m.add_tensor(TensorDef::input("x", DType::Int8, &[1, hw, hw, c_in]).with_quant(vec![QuantParam::new(0.02, 0)]));
    let w: Vec<i8> = (0..c_out * 9 * c_in).map(|i| ((i * 31) % 41) as i8 - 20).collect();
    let w = m.add_tensor(TensorDef::constant("w", &[c_out, 3, 3, c_in], TensorData::Int8(w)).with_quant(vec![QuantParam::new(0.01, 0)]));
    let y = m.add_tensor(TensorDef::var("y", DType::Int8).with_quant(vec![QuantParam::new(0.05, 0)]));
    m.add_node(OpDesc {
        name: "qconv".into(),
        op: OpKind::Conv2D,
        param: OpParameter::Conv(ConvParam::same(3, 1)),
        inputs: vec![x, w],
        outputs: vec![y],
    });
    m.inputs = vec![x];
    m.outputs = vec![y];

    let mut session = LiteSession::create(Context::default().with_thread_num(4))?;
    session.compile_graph(m, &KernelRegistry::with_defaults())?;
    let x = session.inputs()[0];
    if let Some(t) = session.tensor_mut(x) {
        t.ensure_bound();
    }
    session.run_graph(None, None)?;
    let start = Instant::now();
    for _ in 0..iters {
        session.run_graph(None, None)?;
    }
    Ok(start.elapsed().as_secs_f64() * 1000.0 / iters as f64)
}
