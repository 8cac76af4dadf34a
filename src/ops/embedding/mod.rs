//! Embedding-bag sums. Every variant reduces its inputs to a [`BagPlan`],
//! a list of table rows per output row, then runs the same accumulator.
mod offsets_sum;
mod packed_sum;
mod segments_sum;

pub use offsets_sum::EmbeddingBagOffsetsSumNode;
pub use packed_sum::EmbeddingBagPackedSumNode;
pub use segments_sum::EmbeddingSegmentsSumNode;

use crate::blob::{BlobElement, SharedSliceMut};
use crate::dtype::{DType, DTypeError};
use crate::layout::{LayoutDesc, dense_strides, for_each_index};
use crate::node::{
    DataConfig, ImplKind, NodeBase, NodeConfig, NodeDescription, NodeError, PrimitiveDescriptor,
    plain_desc,
};
use crate::parallel::Dispatcher;
use half::{bf16, f16};
use num_traits::Zero;
use std::ops::{AddAssign, Mul};

const TABLE: usize = 0;
const INDICES: usize = 1;

pub trait EmbeddingElement: BlobElement + Zero + Mul<Output = Self> + AddAssign {}

impl EmbeddingElement for f64 {}
impl EmbeddingElement for f32 {}
impl EmbeddingElement for bf16 {}
impl EmbeddingElement for f16 {}
impl EmbeddingElement for i64 {}
impl EmbeddingElement for i32 {}

/// One looked-up table row and the weight slot scaling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    pub row: usize,
    pub weight: Option<usize>,
}

/// Contributions for every output row, flattened. Bag `b` owns
/// `contributions[bounds[b]..bounds[b + 1]]` in index order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BagPlan {
    contributions: Vec<Contribution>,
    bounds: Vec<usize>,
}

impl BagPlan {
    pub fn new() -> Self {
        Self {
            contributions: vec![],
            bounds: vec![0],
        }
    }

    pub fn push(&mut self, contribution: Contribution) {
        self.contributions.push(contribution);
    }

    /// Closes the bag being filled.
    pub fn finish_bag(&mut self) {
        self.bounds.push(self.contributions.len());
    }

    /// Closes the current bag, substituting `default_row` when it received nothing.
    pub fn finish_bag_or_default(&mut self, default_row: Option<usize>) {
        if self.contributions.len() == self.bounds[self.bounds.len() - 1] {
            if let Some(row) = default_row {
                self.push(Contribution { row, weight: None });
            }
        }
        self.finish_bag();
    }

    pub fn num_bags(&self) -> usize {
        self.bounds.len() - 1
    }

    pub fn bag(&self, bag: usize) -> &[Contribution] {
        &self.contributions[self.bounds[bag]..self.bounds[bag + 1]]
    }
}

/// Walks the non-leading output axes with an odometer over precomputed strides.
#[derive(Debug, Clone)]
pub struct RowAccumulator {
    dims: Vec<usize>,
    strides: Vec<usize>,
    row_len: usize,
}

impl RowAccumulator {
    pub fn new(row_dims: &[usize]) -> Self {
        Self {
            dims: row_dims.to_vec(),
            strides: dense_strides(row_dims),
            row_len: row_dims.iter().product(),
        }
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// `dst += src * weight`, element by element over one row.
    pub fn accumulate<T: EmbeddingElement>(&self, src: &[T], dst: &mut [T], weight: Option<T>) {
        for_each_index(&self.dims, |index| {
            let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            match weight {
                Some(w) => dst[offset] += src[offset] * w,
                None => dst[offset] += src[offset],
            }
        });
    }
}

/// Shape facts shared by the three variants, checked at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingShape {
    pub table_rows: usize,
    pub num_bags: usize,
    pub weights_port: Option<usize>,
    pub default_index: Option<usize>,
}

impl EmbeddingShape {
    /// Precision and shape checks common to every variant. `weights_port` is
    /// the port per-sample weights arrive on when present.
    fn new(desc: &NodeDescription, weights_port: usize, uses_default: bool) -> Result<Self, NodeError> {
        let table = &desc.inputs[TABLE];
        let output = &desc.outputs[0];
        if !matches!(
            table.dtype,
            DType::F64 | DType::F32 | DType::BF16 | DType::F16 | DType::I64 | DType::I32
        ) {
            return Err(desc.unsupported(format!("table precision {} is not supported", table.dtype)));
        }
        if table.dims.is_empty() || output.dims.len() != table.dims.len() || output.dims[1..] != table.dims[1..] {
            return Err(desc.unsupported(format!(
                "output dims {:?} do not match table dims {:?}",
                output.dims, table.dims
            )));
        }
        for (port, input) in desc.inputs.iter().enumerate().skip(INDICES) {
            let ok = if port == weights_port {
                input.dtype == table.dtype
            } else {
                matches!(input.dtype, DType::I32 | DType::I64)
            };
            if !ok {
                return Err(desc.unsupported(format!("input {port} has unsupported precision {}", input.dtype)));
            }
        }

        let table_rows = table.dims[0];
        let default_index = match desc.attributes.int("default_index") {
            Some(_) if !uses_default => {
                return Err(desc.unsupported("default_index is not accepted by this operation"));
            }
            Some(index) if index < 0 || index as usize >= table_rows => {
                return Err(NodeError::ConfigurationError(
                    desc.name.clone(),
                    format!("default index {index} is out of range [0, {table_rows})"),
                ));
            }
            Some(index) => Some(index as usize),
            None => None,
        };
        Ok(Self {
            table_rows,
            num_bags: output.dims[0],
            weights_port: (desc.inputs.len() > weights_port).then_some(weights_port),
            default_index,
        })
    }

    /// Resolves one table index, rejecting anything outside the table.
    fn row(&self, base: &NodeBase, index: i64) -> Result<usize, NodeError> {
        if index < 0 || index as usize >= self.table_rows {
            return Err(base.index_error("table index", index, self.table_rows));
        }
        Ok(index as usize)
    }
}

/// The single plain configuration every variant offers.
fn plain_descriptors(desc: &NodeDescription) -> Vec<PrimitiveDescriptor> {
    let table = &desc.inputs[TABLE];
    let config = NodeConfig {
        inputs: desc.inputs.iter().map(|t| DataConfig::new(plain_desc(t))).collect(),
        outputs: vec![DataConfig::new(LayoutDesc::plain(table.dtype, &desc.outputs[0].dims))],
        dyn_batch_support: false,
    };
    vec![PrimitiveDescriptor::new(config, ImplKind::RefAny, plain_desc(table))]
}

fn sum_bags_typed<T: EmbeddingElement>(
    base: &NodeBase,
    dispatcher: &Dispatcher,
    shape: &EmbeddingShape,
    plan: &BagPlan,
) -> Result<(), NodeError> {
    let table_memory = base.input_memory(TABLE)?;
    let table = table_memory.blob().as_slice::<T>()?;
    let weights_memory = match shape.weights_port {
        Some(port) => Some(base.input_memory(port)?),
        None => None,
    };
    let weights = match &weights_memory {
        Some(memory) => Some(memory.blob().as_slice::<T>()?),
        None => None,
    };
    let row_dims = &table_memory.desc().dims()[1..];
    let accumulator = RowAccumulator::new(row_dims);
    let row_len = accumulator.row_len();

    let mut output = base.output_memory(0)?;
    let dst = SharedSliceMut::new(output.blob_mut().as_mut_slice::<T>()?);
    log::trace!(
        "{} {}: {} bags over rows of {} elements",
        base.type_name(),
        base.name(),
        plan.num_bags(),
        row_len
    );

    dispatcher.parallel_for(plan.num_bags(), |bag| {
        // SAFETY: every bag owns its own output row.
        let out = unsafe { dst.slice_mut(bag * row_len, row_len) };
        out.fill(T::zero());
        for contribution in plan.bag(bag) {
            let src = &table[contribution.row * row_len..(contribution.row + 1) * row_len];
            let weight = weights.zip(contribution.weight).map(|(w, slot)| w[slot]);
            accumulator.accumulate(src, out, weight);
        }
    });
    Ok(())
}

fn sum_bags(
    base: &NodeBase,
    dispatcher: &Dispatcher,
    shape: &EmbeddingShape,
    plan: &BagPlan,
) -> Result<(), NodeError> {
    let dtype = base.selected_config()?.outputs[0].desc.dtype();
    match dtype {
        DType::F64 => sum_bags_typed::<f64>(base, dispatcher, shape, plan),
        DType::F32 => sum_bags_typed::<f32>(base, dispatcher, shape, plan),
        DType::BF16 => sum_bags_typed::<bf16>(base, dispatcher, shape, plan),
        DType::F16 => sum_bags_typed::<f16>(base, dispatcher, shape, plan),
        DType::I64 => sum_bags_typed::<i64>(base, dispatcher, shape, plan),
        DType::I32 => sum_bags_typed::<i32>(base, dispatcher, shape, plan),
        other => Err(DTypeError::DTypeNotSupportedByNode(other).into()),
    }
}
