use crate::blob::SharedSliceMut;
use crate::dtype::DType;
use crate::layout::LayoutDesc;
use crate::node::{
    CpuNode, DataConfig, ImplKind, NodeBase, NodeConfig, NodeDescription, NodeError,
    PrimitiveDescriptor, plain_desc,
};
use crate::parallel::Dispatcher;

const DATA: usize = 0;
const INDICES: usize = 1;
const AXIS: usize = 2;

/// Sizes derived once from the data and indices shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherPlan {
    pub axis: usize,
    pub batch_dims: usize,
    pub index_range: usize,
    pub batch_size: usize,
    pub outer_size: usize,
    pub data_length: usize,
    pub src_batch_stride: usize,
    pub idx_batch_stride: usize,
    pub dst_batch_stride: usize,
}

impl GatherPlan {
    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        let config_error = |message: String| NodeError::ConfigurationError(desc.name.clone(), message);
        let src_dims = &desc.inputs[DATA].dims;
        let idx_dims = &desc.inputs[INDICES].dims;
        let dst_dims = &desc.outputs[0].dims;
        let data_rank = src_dims.len() as i64;
        let idx_rank = idx_dims.len() as i64;

        let mut axis = desc.attributes.int_or("axis", 0);
        if axis < 0 {
            axis += data_rank;
        }
        if !(0..data_rank).contains(&axis) {
            return Err(config_error(format!("axis {axis} is out of range for data rank {data_rank}")));
        }
        let mut batch_dims = desc.attributes.int_or("batch_dims", 0);
        if batch_dims < 0 {
            batch_dims += idx_rank;
        }
        if !(0 <= batch_dims && batch_dims < data_rank.min(idx_rank)) || batch_dims > axis {
            return Err(config_error(format!("batch_dims {batch_dims} is invalid for axis {axis}")));
        }
        let axis = axis as usize;
        let batch_dims = batch_dims as usize;
        if src_dims[..batch_dims] != idx_dims[..batch_dims] {
            return Err(config_error(format!(
                "leading {batch_dims} dims of data {src_dims:?} and indices {idx_dims:?} differ"
            )));
        }

        let expected: Vec<usize> = src_dims[..axis]
            .iter()
            .chain(&idx_dims[batch_dims..])
            .chain(&src_dims[axis + 1..])
            .copied()
            .collect();
        if &expected != dst_dims {
            return Err(config_error(format!("output dims {dst_dims:?} should be {expected:?}")));
        }

        let plan = Self {
            axis,
            batch_dims,
            index_range: src_dims[axis],
            batch_size: src_dims[..batch_dims].iter().product(),
            outer_size: src_dims[batch_dims..axis].iter().product(),
            data_length: src_dims[axis + 1..].iter().product(),
            src_batch_stride: src_dims[batch_dims..].iter().product(),
            idx_batch_stride: idx_dims[batch_dims..].iter().product(),
            dst_batch_stride: dst_dims[batch_dims..].iter().product(),
        };
        if plan.data_length == 0 {
            return Err(config_error("gathered rows are empty".to_string()));
        }
        Ok(plan)
    }
}

#[derive(Debug)]
pub struct GatherNode {
    base: NodeBase,
    plan: GatherPlan,
}

impl GatherNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        desc.check_port_counts(2..=3, 1)?;
        if desc.inputs[DATA].dims.is_empty() {
            return Err(desc.unsupported("data must have at least one dimension"));
        }
        if desc.inputs.get(AXIS).is_some_and(|t| !t.constant) {
            return Err(desc.unsupported("only a constant axis input is supported"));
        }
        Ok(())
    }

    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        Self::is_supported(desc)?;
        Ok(Self {
            base: NodeBase::new(desc),
            plan: GatherPlan::new(desc)?,
        })
    }

    pub fn plan(&self) -> &GatherPlan {
        &self.plan
    }
}

impl CpuNode for GatherNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn init_supported_primitive_descriptors(&self) -> Result<Vec<PrimitiveDescriptor>, NodeError> {
        let desc = self.base.description();
        let data = &desc.inputs[DATA];
        let indices = &desc.inputs[INDICES];
        let idx_dtype = match indices.dtype {
            DType::I32 | DType::I64 | DType::F32 => indices.dtype,
            _ => DType::I32,
        };

        let mut inputs = vec![
            DataConfig::new(plain_desc(data)),
            DataConfig::new(LayoutDesc::plain(idx_dtype, &indices.dims)),
        ];
        if let Some(axis) = desc.inputs.get(AXIS) {
            inputs.push(DataConfig::constant(plain_desc(axis)));
        }
        let output = LayoutDesc::plain(data.dtype, &desc.outputs[0].dims);
        let config = NodeConfig {
            inputs,
            outputs: vec![DataConfig::new(output)],
            dyn_batch_support: false,
        };
        Ok(vec![PrimitiveDescriptor::new(config, ImplKind::RefAny, plain_desc(data))])
    }

    fn execute(&self, dispatcher: &Dispatcher, _batch: Option<usize>) -> Result<(), NodeError> {
        self.base.check_prepared()?;
        let plan = &self.plan;
        let data = self.base.input_memory(DATA)?;
        let indices = self.base.input_memory(INDICES)?;

        let mut idx = indices.blob().index_values()?;
        let range = plan.index_range as i64;
        for value in idx.iter_mut() {
            if (-range..0).contains(value) {
                *value += range;
            } else if !(0..range).contains(value) {
                return Err(self.base.index_error("gather index", *value, plan.index_range));
            }
        }

        let mut output = self.base.output_memory(0)?;
        let item = data.desc().dtype().size();
        let len = plan.data_length * item;
        let src = data.blob().as_bytes();
        let dst = SharedSliceMut::new(output.blob_mut().as_bytes_mut());
        log::trace!(
            "Gather {}: {}x{} partitions, {} outer runs of {} bytes",
            self.base.name(),
            plan.batch_size,
            plan.idx_batch_stride,
            plan.outer_size,
            len
        );

        dispatcher.parallel_for2d(plan.batch_size, plan.idx_batch_stride, |i, j| {
            let index = idx[i * plan.idx_batch_stride + j] as usize;
            for k in 0..plan.outer_size {
                let src_start = (i * plan.src_batch_stride + k * plan.data_length * plan.index_range) * item;
                let dst_start = (i * plan.dst_batch_stride + k * plan.data_length * plan.idx_batch_stride) * item;
                let from = src_start + index * len;
                // SAFETY: (i, j, k) addresses a distinct output run.
                let out = unsafe { dst.slice_mut(dst_start + j * len, len) };
                out.copy_from_slice(&src[from..from + len]);
            }
        });
        Ok(())
    }
}
