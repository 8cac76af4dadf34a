use crate::node_tests::{memory, run};
use half::bf16;
use ndarray::{ArrayD, IxDyn};
use whisper_tensor_cpu::dtype::DType;
use whisper_tensor_cpu::parallel::Dispatcher;
use whisper_tensor_cpu::{NodeDescription, NodeError, NodeRegistry, TensorDesc};

fn out_dims(bags: usize, table_dims: &[usize]) -> Vec<usize> {
    let mut dims = vec![bags];
    dims.extend_from_slice(&table_dims[1..]);
    dims
}

pub fn offsets_desc(
    dtype: DType,
    table_dims: &[usize],
    num_indices: usize,
    num_bags: usize,
    with_weights: bool,
) -> NodeDescription {
    let desc = NodeDescription::new("EmbeddingBagOffsetsSum", "bag")
        .with_input(TensorDesc::new(dtype, table_dims))
        .with_input(TensorDesc::new(DType::I64, &[num_indices]))
        .with_input(TensorDesc::new(DType::I64, &[num_bags]))
        .with_output(TensorDesc::new(dtype, &out_dims(num_bags, table_dims)));
    if with_weights {
        desc.with_input(TensorDesc::new(dtype, &[num_indices]))
    } else {
        desc
    }
}

fn packed_desc(dtype: DType, table_dims: &[usize], num_bags: usize, per_bag: usize, with_weights: bool) -> NodeDescription {
    let desc = NodeDescription::new("EmbeddingBagPackedSum", "packed")
        .with_input(TensorDesc::new(dtype, table_dims))
        .with_input(TensorDesc::new(DType::I32, &[num_bags, per_bag]))
        .with_output(TensorDesc::new(dtype, &out_dims(num_bags, table_dims)));
    if with_weights {
        desc.with_input(TensorDesc::new(dtype, &[num_bags, per_bag]))
    } else {
        desc
    }
}

fn segments_desc(
    dtype: DType,
    table_dims: &[usize],
    num_indices: usize,
    num_segments: usize,
    with_weights: bool,
) -> NodeDescription {
    let desc = NodeDescription::new("EmbeddingSegmentsSum", "segments")
        .with_input(TensorDesc::new(dtype, table_dims))
        .with_input(TensorDesc::new(DType::I32, &[num_indices]))
        .with_input(TensorDesc::new(DType::I32, &[num_indices]))
        .with_output(TensorDesc::new(dtype, &out_dims(num_segments, table_dims)));
    if with_weights {
        desc.with_input(TensorDesc::new(dtype, &[num_indices]))
    } else {
        desc
    }
}

fn table_4x2() -> Vec<f32> {
    vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
}

pub fn test_offsets_sum_basic(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[3, 2], 3, 2, false);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]),
            memory(vec![0i64, 1, 2], &[3]),
            memory(vec![0i64, 2], &[2]),
        ],
    )
    .unwrap();
    assert_eq!(out[0].desc().dims(), &[2, 2]);
    assert_eq!(out[0].blob().to_vec::<f32>().unwrap(), vec![4.0, 6.0, 5.0, 6.0]);
}

pub fn test_offsets_sum_weighted_with_default(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[4, 2], 3, 3, true).with_attribute("default_index", 1i64);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![0i64, 2, 3], &[3]),
            memory(vec![0i64, 0, 2], &[3]),
            memory(vec![0.5f32, 2.0, -1.0], &[3]),
        ],
    )
    .unwrap();
    // The default row is not scaled by any weight.
    assert_eq!(
        out[0].blob().to_vec::<f32>().unwrap(),
        vec![3.0, 4.0, 10.5, 13.0, -7.0, -8.0]
    );
}

pub fn test_offsets_sum_empty_bag_without_default(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[4, 2], 2, 3, false);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![1i64, 2], &[2]),
            memory(vec![0i64, 0, 1], &[3]),
        ],
    )
    .unwrap();
    assert_eq!(
        out[0].blob().to_vec::<f32>().unwrap(),
        vec![0.0, 0.0, 3.0, 4.0, 5.0, 6.0]
    );
}

pub fn test_offsets_sum_bad_offset(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[3, 2], 3, 2, false);
    let err = run(
        &desc,
        dispatcher,
        &[
            memory(vec![0.0f32; 6], &[3, 2]),
            memory(vec![0i64, 1, 2], &[3]),
            memory(vec![0i64, 5], &[2]),
        ],
    )
    .unwrap_err();
    assert!(
        matches!(err, NodeError::IndexOutOfRange { value: 5, bound: 3, .. }),
        "{err}"
    );
}

pub fn test_offsets_sum_rank3_table(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F64, &[3, 2, 2], 3, 2, false);
    let table = ArrayD::from_shape_vec(IxDyn(&[3, 2, 2]), (0..12).map(|x| x as f64).collect()).unwrap();
    let out = run(
        &desc,
        dispatcher,
        &[
            whisper_tensor_cpu::Memory::from_ndarray(&table),
            memory(vec![2i64, 0, 2], &[3]),
            memory(vec![0i64, 1], &[2]),
        ],
    )
    .unwrap();
    let result = out[0].to_ndarray::<f64>().unwrap();
    assert_eq!(result.index_axis(ndarray::Axis(0), 0), table.index_axis(ndarray::Axis(0), 2));
    let second = &table.index_axis(ndarray::Axis(0), 0) + &table.index_axis(ndarray::Axis(0), 2);
    assert_eq!(result.index_axis(ndarray::Axis(0), 1), second);
}

pub fn test_packed_sum_weighted(dispatcher: &Dispatcher) {
    let desc = packed_desc(DType::F32, &[3, 2], 2, 2, true);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]),
            memory(vec![0i32, 1, 2, 2], &[2, 2]),
            memory(vec![1.0f32, 2.0, 0.5, 0.5], &[2, 2]),
        ],
    )
    .unwrap();
    assert_eq!(out[0].blob().to_vec::<f32>().unwrap(), vec![7.0, 10.0, 5.0, 6.0]);
}

pub fn test_packed_sum_bf16(dispatcher: &Dispatcher) {
    let desc = packed_desc(DType::BF16, &[3, 2], 1, 2, false);
    let table: Vec<bf16> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0].iter().map(|&x| bf16::from_f32(x)).collect();
    let out = run(
        &desc,
        dispatcher,
        &[memory(table, &[3, 2]), memory(vec![0i32, 2], &[1, 2])],
    )
    .unwrap();
    assert_eq!(
        out[0].blob().to_vec::<bf16>().unwrap(),
        vec![bf16::from_f32(6.0), bf16::from_f32(8.0)]
    );
}

pub fn test_segments_sum_unsorted_with_default(dispatcher: &Dispatcher) {
    let desc = segments_desc(DType::F32, &[4, 2], 4, 4, false).with_attribute("default_index", 1i64);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![3i32, 0, 2, 1], &[4]),
            memory(vec![2i32, 0, 2, 0], &[4]),
        ],
    )
    .unwrap();
    assert_eq!(
        out[0].blob().to_vec::<f32>().unwrap(),
        vec![4.0, 6.0, 3.0, 4.0, 12.0, 14.0, 3.0, 4.0]
    );
}

pub fn test_segments_sum_bad_segment(dispatcher: &Dispatcher) {
    let desc = segments_desc(DType::F32, &[4, 2], 2, 4, false);
    let err = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![0i32, 1], &[2]),
            memory(vec![0i32, 4], &[2]),
        ],
    )
    .unwrap_err();
    assert!(
        matches!(err, NodeError::IndexOutOfRange { value: 4, bound: 4, .. }),
        "{err}"
    );
}

pub fn test_segments_sum_i32_table(dispatcher: &Dispatcher) {
    let desc = segments_desc(DType::I32, &[2, 2], 2, 1, true);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(vec![1i32, 2, 3, 4], &[2, 2]),
            memory(vec![0i32, 1], &[2]),
            memory(vec![0i32, 0], &[2]),
            memory(vec![2i32, 3], &[2]),
        ],
    )
    .unwrap();
    assert_eq!(out[0].blob().to_vec::<i32>().unwrap(), vec![11, 16]);
}

pub fn test_embedding_bad_table_index(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[3, 2], 2, 1, false);
    for bad in [3i64, -1] {
        let err = run(
            &desc,
            dispatcher,
            &[
                memory(vec![0.0f32; 6], &[3, 2]),
                memory(vec![0i64, bad], &[2]),
                memory(vec![0i64], &[1]),
            ],
        )
        .unwrap_err();
        assert!(
            matches!(err, NodeError::IndexOutOfRange { value, bound: 3, .. } if value == bad),
            "{err}"
        );
    }
}

pub fn test_offsets_sum_decreasing_offsets(dispatcher: &Dispatcher) {
    let desc = offsets_desc(DType::F32, &[4, 2], 3, 3, false);
    let err = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![0i64, 1, 2], &[3]),
            memory(vec![0i64, 2, 1], &[3]),
        ],
    )
    .unwrap_err();
    assert!(
        matches!(err, NodeError::IndexOutOfRange { value: 1, bound: 3, .. }),
        "{err}"
    );
}

pub fn test_packed_sum_rejects_default_index(_dispatcher: &Dispatcher) {
    let registry = NodeRegistry::with_default_nodes();
    let desc = packed_desc(DType::F32, &[3, 2], 2, 2, false).with_attribute("default_index", 0i64);
    assert!(matches!(registry.construct(&desc), Err(NodeError::UnsupportedOperation(..))));
}

pub fn test_segments_sum_bad_default_index(_dispatcher: &Dispatcher) {
    let registry = NodeRegistry::with_default_nodes();
    for bad in [4i64, -1] {
        let desc = segments_desc(DType::F32, &[4, 2], 2, 3, false).with_attribute("default_index", bad);
        assert!(
            matches!(registry.construct(&desc), Err(NodeError::ConfigurationError(..))),
            "default index {bad}"
        );
    }
}

pub fn test_segments_sum_empty_segment_stays_zero(dispatcher: &Dispatcher) {
    let desc = segments_desc(DType::F32, &[4, 2], 2, 3, false);
    let out = run(
        &desc,
        dispatcher,
        &[
            memory(table_4x2(), &[4, 2]),
            memory(vec![3i32, 0], &[2]),
            memory(vec![2i32, 0], &[2]),
        ],
    )
    .unwrap();
    assert_eq!(
        out[0].blob().to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 0.0, 0.0, 7.0, 8.0]
    );
}
