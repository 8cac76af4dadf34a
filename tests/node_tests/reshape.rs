use crate::node_tests::{build, iota_f32, run, run_with};
use whisper_tensor_cpu::dtype::DType;
use whisper_tensor_cpu::node::PrimitiveDescriptor;
use whisper_tensor_cpu::parallel::Dispatcher;
use whisper_tensor_cpu::{CpuNode, Edge, NodeDescription, PortRef, TensorDesc};

pub fn test_reshape_in_place(dispatcher: &Dispatcher) {
    let desc = NodeDescription::new("Reshape", "reshape")
        .with_input(TensorDesc::new(DType::F32, &[2, 3, 4]))
        .with_input(TensorDesc::constant(DType::I64, &[2]))
        .with_output(TensorDesc::new(DType::F32, &[6, 4]));
    let mut node = build(&desc);
    let candidates = node.enumerate().unwrap().to_vec();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].config.outputs[0].in_place, Some(0));
    assert!(candidates[0].config.inputs[1].constant);

    let outputs = run_with(
        &mut node,
        dispatcher,
        &[iota_f32(&[2, 3, 4])],
        &|_: &PrimitiveDescriptor| true,
        None,
    )
    .unwrap();
    assert_eq!(outputs[0].desc().dims(), &[6, 4]);
    assert_eq!(outputs[0].blob(), iota_f32(&[2, 3, 4]).blob());

    let unsqueeze = NodeDescription::new("Unsqueeze", "unsqueeze")
        .with_input(TensorDesc::new(DType::F32, &[3]))
        .with_output(TensorDesc::new(DType::F32, &[1, 3, 1]));
    let out = run(&unsqueeze, dispatcher, &[iota_f32(&[3])]).unwrap();
    assert_eq!(out[0].desc().dims(), &[1, 3, 1]);
    assert_eq!(out[0].blob().to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0]);
}

pub fn test_reshape_shares_input_buffer(dispatcher: &Dispatcher) {
    let desc = NodeDescription::new("Reshape", "view")
        .with_input(TensorDesc::new(DType::F32, &[2, 3]))
        .with_output(TensorDesc::new(DType::F32, &[6]));
    let mut node = build(&desc);
    node.select_preferred(&|_: &PrimitiveDescriptor| true).unwrap();
    let input = iota_f32(&[2, 3]);
    let source = Edge::with_memory(PortRef::new("source", 0), PortRef::new("view", 0), input.clone());
    let sink = Edge::new(PortRef::new("view", 0), PortRef::new("sink", 0));
    node.attach_input(0, source.clone()).unwrap();
    node.attach_output(0, sink.clone()).unwrap();
    node.prepare().unwrap();
    node.execute(dispatcher, None).unwrap();

    let out = sink.memory().unwrap();
    let held = source.memory().unwrap();
    assert_eq!(out.desc().dims(), &[6]);
    assert!(out.shares_blob(&held));
    assert_eq!(out.blob().as_bytes().as_ptr(), held.blob().as_bytes().as_ptr());
    assert!(out.shares_blob(&input));
}
