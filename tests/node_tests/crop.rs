use crate::node_tests::{build, iota_f32, memory, run, run_with};
use ndarray::{ArrayD, Axis, IxDyn, s};
use whisper_tensor_cpu::dtype::DType;
use whisper_tensor_cpu::layout::FormatKind;
use whisper_tensor_cpu::node::PrimitiveDescriptor;
use whisper_tensor_cpu::parallel::Dispatcher;
use whisper_tensor_cpu::{CpuNode, Memory, NodeDescription, TensorDesc};

fn slice_desc(in_dims: &[usize], out_dims: &[usize], begin: Vec<i64>) -> NodeDescription {
    let strides = vec![1i64; begin.len()];
    NodeDescription::new("StridedSlice", "slice")
        .with_input(TensorDesc::new(DType::F32, in_dims))
        .with_input(TensorDesc::constant(DType::I64, &[begin.len()]))
        .with_output(TensorDesc::new(DType::F32, out_dims))
        .with_attribute("begin", begin)
        .with_attribute("strides", strides)
}

fn iota_array(dims: &[usize]) -> ArrayD<f32> {
    iota_f32(dims).to_ndarray::<f32>().unwrap()
}

/// Runs `desc` once per offered layout and checks each against `expected`.
/// Returns the formats that were offered.
fn check_every_layout(
    desc: &NodeDescription,
    input: &Memory,
    expected: &ArrayD<f32>,
    dispatcher: &Dispatcher,
) -> Vec<FormatKind> {
    let formats: Vec<FormatKind> = build(desc)
        .enumerate()
        .unwrap()
        .iter()
        .map(|pd| pd.preferred.format())
        .collect();
    for &format in &formats {
        let mut node = build(desc);
        let outputs = run_with(
            &mut node,
            dispatcher,
            std::slice::from_ref(input),
            &|pd: &PrimitiveDescriptor| pd.preferred.format() == format,
            None,
        )
        .unwrap();
        assert_eq!(outputs[0].desc().format(), format);
        assert_eq!(&outputs[0].to_ndarray::<f32>().unwrap(), expected, "layout {format:?}");
    }
    formats
}

pub fn test_crop_channels_plain(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[1, 8, 4, 4], &[1, 4, 4, 4], vec![0, 2, 0, 0]);
    let input = iota_array(&[1, 8, 4, 4]);
    let expected = input.slice(s![.., 2..6, .., ..]).to_owned().into_dyn();
    let formats = check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);
    // An offset of 2 channels splits every block.
    assert_eq!(formats, vec![FormatKind::Plain]);
}

pub fn test_crop_blocked_layouts_match_plain(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[2, 32, 3, 5], &[1, 16, 2, 5], vec![1, 16, 1, 0]);
    let input = iota_array(&[2, 32, 3, 5]);
    let expected = input.slice(s![1..2, 16..32, 1..3, ..]).to_owned().into_dyn();
    let formats = check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);
    assert_eq!(
        formats,
        vec![
            FormatKind::Blocked { axis: 1, block: 16 },
            FormatKind::Blocked { axis: 1, block: 8 },
            FormatKind::Plain
        ]
    );
}

pub fn test_crop_blocked_5d(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[1, 24, 2, 3, 4], &[1, 8, 1, 3, 2], vec![0, 8, 1, 0, -2]);
    let input = iota_array(&[1, 24, 2, 3, 4]);
    let expected = input.slice(s![.., 8..16, 1..2, .., 2..4]).to_owned().into_dyn();
    let formats = check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);
    assert_eq!(formats, vec![FormatKind::Blocked { axis: 1, block: 8 }, FormatKind::Plain]);
}

pub fn test_crop_shrink_and_new_axis(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[2, 3, 4], &[1, 3, 3], vec![1, 0, 0, -3])
        .with_attribute("shrink_axis_mask", vec![1i64, 0, 0, 0])
        .with_attribute("new_axis_mask", vec![0i64, 1, 0, 0]);
    let input = iota_array(&[2, 3, 4]);
    let expected = input
        .slice(s![1, .., 1..4])
        .to_owned()
        .insert_axis(Axis(0))
        .into_dyn();
    let formats = check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);
    assert_eq!(formats, vec![FormatKind::Plain]);
}

pub fn test_crop_ellipsis(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[2, 3, 4, 5], &[2, 3, 4, 4], vec![0, 1])
        .with_attribute("ellipsis_mask", vec![1i64, 0]);
    let input = iota_array(&[2, 3, 4, 5]);
    let expected = input.slice(s![.., .., .., 1..5]).to_owned().into_dyn();
    check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);

    // Begin mask ignores the begin value; inner axes keep their full extent.
    let desc = slice_desc(&[2, 3, 4, 5], &[1, 2, 4, 5], vec![7, 1])
        .with_attribute("begin_mask", vec![1i64, 0]);
    let expected = input.slice(s![0..1, 1..3, .., ..]).to_owned().into_dyn();
    check_every_layout(&desc, &Memory::from_ndarray(&input), &expected, dispatcher);
}

pub fn test_crop_rank_1(dispatcher: &Dispatcher) {
    let desc = slice_desc(&[10], &[4], vec![-6]);
    let out = run(&desc, dispatcher, &[iota_f32(&[10])]).unwrap();
    assert_eq!(out[0].blob().to_vec::<f32>().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
}

pub fn test_crop_dynamic_batch(dispatcher: &Dispatcher) {
    let desc = NodeDescription::new("Crop", "crop")
        .with_input(TensorDesc::new(DType::F32, &[4, 16, 1, 1]))
        .with_output(TensorDesc::new(DType::F32, &[4, 8, 1, 1]))
        .with_attribute("begin", vec![0i64, 8, 0, 0]);
    let input = iota_array(&[4, 16, 1, 1]);

    let mut node = build(&desc);
    let outputs = run_with(
        &mut node,
        dispatcher,
        &[Memory::from_ndarray(&input)],
        &|pd: &PrimitiveDescriptor| pd.preferred.is_plain(),
        Some(2),
    )
    .unwrap();
    assert!(node.base().selected_config().unwrap().dyn_batch_support);
    let result = outputs[0].to_ndarray::<f32>().unwrap();
    assert_eq!(result.slice(s![0..2, .., .., ..]), input.slice(s![0..2, 8..16, .., ..]));
    assert!(result.slice(s![2..4, .., .., ..]).iter().all(|&x| x == 0.0));

    // The full batch on the next run.
    node.execute(dispatcher, None).unwrap();
    let result = outputs_of(&node);
    assert_eq!(result, input.slice(s![.., 8..16, .., ..]).to_owned().into_dyn());
}

fn outputs_of(node: &impl CpuNode) -> ArrayD<f32> {
    node.base()
        .output_edge(0)
        .unwrap()
        .memory()
        .unwrap()
        .to_ndarray::<f32>()
        .unwrap()
}

pub fn test_crop_i64_precision(dispatcher: &Dispatcher) {
    let desc = NodeDescription::new("StridedSlice", "slice_i64")
        .with_input(TensorDesc::new(DType::I64, &[3, 4]))
        .with_output(TensorDesc::new(DType::I64, &[2, 2]))
        .with_attribute("begin", vec![1i64, 1]);
    let input = memory((0..12i64).collect(), &[3, 4]);
    let out = run(&desc, dispatcher, &[input]).unwrap();
    let expected = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![5i64, 6, 9, 10]).unwrap();
    assert_eq!(out[0].to_ndarray::<i64>().unwrap(), expected);
}

pub fn test_crop_shrunk_batch_is_static(dispatcher: &Dispatcher) {
    // Axis 0 is shrunk away, so output axis 0 is the input's axis 1.
    let desc = slice_desc(&[2, 3, 4], &[3, 4], vec![1, 0, 0]).with_attribute("shrink_axis_mask", vec![1i64, 0, 0]);
    let input = iota_array(&[2, 3, 4]);
    let mut node = build(&desc);
    let outputs = run_with(
        &mut node,
        dispatcher,
        &[Memory::from_ndarray(&input)],
        &|_: &PrimitiveDescriptor| true,
        Some(1),
    )
    .unwrap();
    assert!(!node.base().selected_config().unwrap().dyn_batch_support);
    let expected = input.slice(s![1, .., ..]).to_owned().into_dyn();
    assert_eq!(outputs[0].to_ndarray::<f32>().unwrap(), expected);
}
