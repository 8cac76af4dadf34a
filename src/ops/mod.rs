pub mod crop;
pub mod embedding;
pub mod gather;
pub mod reshape;

pub use crop::{CropNode, CropParams};
pub use embedding::{EmbeddingBagOffsetsSumNode, EmbeddingBagPackedSumNode, EmbeddingSegmentsSumNode};
pub use gather::{GatherNode, GatherPlan};
pub use reshape::ReshapeNode;

use crate::node::{CpuNode, NodeBase, NodeError, PrimitiveDescriptor};
use crate::parallel::Dispatcher;

#[derive(Debug, strum_macros::IntoStaticStr)]
pub enum AnyCpuNode {
    Crop(CropNode),
    Gather(GatherNode),
    EmbeddingBagOffsetsSum(EmbeddingBagOffsetsSumNode),
    EmbeddingBagPackedSum(EmbeddingBagPackedSumNode),
    EmbeddingSegmentsSum(EmbeddingSegmentsSumNode),
    Reshape(ReshapeNode),
}

macro_rules! delegate {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&self, $($arg: $ty),*) -> $ret {
            match self {
                AnyCpuNode::Crop(x) => x.$name($($arg),*),
                AnyCpuNode::Gather(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingBagOffsetsSum(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingBagPackedSum(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingSegmentsSum(x) => x.$name($($arg),*),
                AnyCpuNode::Reshape(x) => x.$name($($arg),*),
            }
        }
    };
}

macro_rules! delegate_mut {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&mut self, $($arg: $ty),*) -> $ret {
            match self {
                AnyCpuNode::Crop(x) => x.$name($($arg),*),
                AnyCpuNode::Gather(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingBagOffsetsSum(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingBagPackedSum(x) => x.$name($($arg),*),
                AnyCpuNode::EmbeddingSegmentsSum(x) => x.$name($($arg),*),
                AnyCpuNode::Reshape(x) => x.$name($($arg),*),
            }
        }
    };
}

impl CpuNode for AnyCpuNode {
    delegate!(base() -> &NodeBase);

    delegate_mut!(base_mut() -> &mut NodeBase);

    delegate!(init_supported_primitive_descriptors() -> Result<Vec<PrimitiveDescriptor>, NodeError>);

    delegate!(execute(dispatcher: &Dispatcher, batch: Option<usize>) -> Result<(), NodeError>);

    delegate_mut!(prepare() -> Result<(), NodeError>);
}

impl AnyCpuNode {
    /// Kernel family, independent of the operator type the node was built for.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}
