use super::{BagPlan, Contribution, EmbeddingShape, INDICES, plain_descriptors, sum_bags};
use crate::node::{CpuNode, NodeBase, NodeDescription, NodeError, PrimitiveDescriptor};
use crate::parallel::Dispatcher;

const WEIGHTS: usize = 2;

/// Bags of a fixed size: row `b` of the 2-D indices tensor is bag `b`.
#[derive(Debug)]
pub struct EmbeddingBagPackedSumNode {
    base: NodeBase,
    shape: EmbeddingShape,
    indices_per_bag: usize,
}

impl EmbeddingBagPackedSumNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        Self::check(desc).map(|_| ())
    }

    fn check(desc: &NodeDescription) -> Result<(EmbeddingShape, usize), NodeError> {
        desc.check_port_counts(2..=3, 1)?;
        let shape = EmbeddingShape::new(desc, WEIGHTS, false)?;
        let indices = &desc.inputs[INDICES];
        if indices.rank() != 2 {
            return Err(desc.unsupported("indices must be 2-D"));
        }
        if indices.dims[0] != shape.num_bags {
            return Err(desc.unsupported(format!(
                "{} index rows for {} output bags",
                indices.dims[0], shape.num_bags
            )));
        }
        if desc.inputs.get(WEIGHTS).is_some_and(|w| w.dims != indices.dims) {
            return Err(desc.unsupported("per-sample weights must match the indices shape"));
        }
        Ok((shape, indices.dims[1]))
    }

    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        let (shape, indices_per_bag) = Self::check(desc)?;
        Ok(Self {
            base: NodeBase::new(desc),
            shape,
            indices_per_bag,
        })
    }

    fn bag_plan(&self) -> Result<BagPlan, NodeError> {
        let indices = self.base.input_memory(INDICES)?.blob().index_values()?;
        let mut plan = BagPlan::new();
        for bag in 0..self.shape.num_bags {
            for position in bag * self.indices_per_bag..(bag + 1) * self.indices_per_bag {
                plan.push(Contribution {
                    row: self.shape.row(&self.base, indices[position])?,
                    weight: self.shape.weights_port.map(|_| position),
                });
            }
            plan.finish_bag();
        }
        Ok(plan)
    }
}

impl CpuNode for EmbeddingBagPackedSumNode {
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
