use super::{BagPlan, Contribution, EmbeddingShape, INDICES, plain_descriptors, sum_bags};
use crate::node::{CpuNode, NodeBase, NodeDescription, NodeError, PrimitiveDescriptor};
use crate::parallel::Dispatcher;

const SEGMENT_IDS: usize = 2;
const WEIGHTS: usize = 3;

/// Every index names the output segment it is added to. Segments are the
/// leading output axis; ids need not be sorted.
#[derive(Debug)]
pub struct EmbeddingSegmentsSumNode {
    base: NodeBase,
    shape: EmbeddingShape,
}

impl EmbeddingSegmentsSumNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        Self::check(desc).map(|_| ())
    }

    fn check(desc: &NodeDescription) -> Result<EmbeddingShape, NodeError> {
        desc.check_port_counts(3..=4, 1)?;
        let shape = EmbeddingShape::new(desc, WEIGHTS, true)?;
        let indices = &desc.inputs[INDICES];
        if indices.rank() != 1 || desc.inputs[SEGMENT_IDS].dims != indices.dims {
            return Err(desc.unsupported("indices and segment ids must be 1-D of equal length"));
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
        let segment_ids = self.base.input_memory(SEGMENT_IDS)?.blob().index_values()?;
        let num_segments = self.shape.num_bags;

        // Stable bucket of positions by segment.
        let mut starts = vec![0usize; num_segments + 1];
        for &id in &segment_ids {
            if id < 0 || id as usize >= num_segments {
                return Err(self.base.index_error("segment id", id, num_segments));
            }
            starts[id as usize + 1] += 1;
        }
        for segment in 0..num_segments {
            starts[segment + 1] += starts[segment];
        }
        let mut fill = starts.clone();
        let mut positions = vec![0usize; segment_ids.len()];
        for (position, &id) in segment_ids.iter().enumerate() {
            positions[fill[id as usize]] = position;
            fill[id as usize] += 1;
        }

        let mut plan = BagPlan::new();
        for segment in 0..num_segments {
            for &position in &positions[starts[segment]..starts[segment + 1]] {
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

impl CpuNode for EmbeddingSegmentsSumNode {
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
