use super::{BagPlan, Contribution, EmbeddingShape, INDICES, plain_descriptors, sum_bags};
use crate::node::{CpuNode, NodeBase, NodeDescription, NodeError, PrimitiveDescriptor};
use crate::parallel::Dispatcher;

const OFFSETS: usize = 2;
const WEIGHTS: usize = 3;

/// Bag `k` sums `indices[offsets[k]..offsets[k + 1]]`; the last bag runs to the end.
#[derive(Debug)]
pub struct EmbeddingBagOffsetsSumNode {
    base: NodeBase,
    shape: EmbeddingShape,
}

impl EmbeddingBagOffsetsSumNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        Self::check(desc).map(|_| ())
    }

    fn check(desc: &NodeDescription) -> Result<EmbeddingShape, NodeError> {
        desc.check_port_counts(3..=4, 1)?;
        let shape = EmbeddingShape::new(desc, WEIGHTS, true)?;
        let indices = &desc.inputs[INDICES];
        let offsets = &desc.inputs[OFFSETS];
        if indices.rank() != 1 || offsets.rank() != 1 {
            return Err(desc.unsupported("indices and offsets must be 1-D"));
        }
        if offsets.dims[0] != shape.num_bags {
            return Err(desc.unsupported(format!(
                "{} offsets for {} output bags",
                offsets.dims[0], shape.num_bags
            )));
        }
        if desc.inputs.get(WEIGHTS).is_some_and(|w| w.dims != indices.dims) {
            return Err(desc.unsupported("per-sample weights must match the indices shape"));
        }
        Ok(shape)
    }

    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        Ok(Self {
            shape: Self::check(desc)?,
            base: NodeBase::new(desc),
        })
    }

    fn bag_plan(&self) -> Result<BagPlan, NodeError> {
        let indices = self.base.input_memory(INDICES)?.blob().index_values()?;
        let offsets = self.base.input_memory(OFFSETS)?.blob().index_values()?;
        let count = indices.len();

        let mut plan = BagPlan::new();
        for (bag, &start) in offsets.iter().enumerate() {
            if start < 0 || start as usize >= count {
                return Err(self.base.index_error("offset", start, count));
            }
            let start = start as usize;
            let end = match offsets.get(bag + 1) {
                Some(&next) if next < start as i64 => {
                    return Err(self.base.index_error("offset below its predecessor", next, count));
                }
                Some(&next) => (next as usize).min(count),
                None => count,
            };
            for position in start..end {
                plan.push(Contribution {
                    row: self.shape.row(&self.base, indices[position])?,
                    weight: self.shape.weights_port.map(|_| position),
                });
            }
            plan.finish_bag_or_default(self.shape.default_index);
        }
        Ok(plan)
    }
}

impl CpuNode for EmbeddingBagOffsetsSumNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn init_supported_primitive_descriptors(&self) -> Result<Vec<PrimitiveDescriptor>, NodeError> {
        Ok(plain_descriptors(self.base.description()))
    }

    fn execute(&self, dispatcher: &Dispatcher, _batch: Option<usize>) -> Result<(), NodeError> {
        self.base.check_prepared()?;
        let plan = self.bag_plan()?;
        sum_bags(&self.base, dispatcher, &self.shape, &plan)
    }
}
