use crate::node::{NodeDescription, NodeError};
use crate::ops::{
    AnyCpuNode, CropNode, EmbeddingBagOffsetsSumNode, EmbeddingBagPackedSumNode,
    EmbeddingSegmentsSumNode, GatherNode, ReshapeNode,
};

pub type SupportPredicate = Box<dyn Fn(&NodeDescription) -> Result<(), NodeError> + Send + Sync>;
pub type Constructor = Box<dyn Fn(&NodeDescription) -> Result<AnyCpuNode, NodeError> + Send + Sync>;

struct RegistryEntry {
    type_name: String,
    is_supported: SupportPredicate,
    constructor: Constructor,
}

/// Ordered table of node implementations. Several entries may share a type
/// name; the earliest registered one that accepts a description wins.
#[derive(Default)]
pub struct NodeRegistry {
    entries: Vec<RegistryEntry>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.type_name))
            .finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_nodes() -> Self {
        let mut registry = Self::new();
        for type_name in ["Crop", "StridedSlice"] {
            registry.register(type_name, CropNode::is_supported, |d| Ok(AnyCpuNode::Crop(CropNode::new(d)?)));
        }
        registry.register("Gather", GatherNode::is_supported, |d| {
            Ok(AnyCpuNode::Gather(GatherNode::new(d)?))
        });
        registry.register("EmbeddingBagOffsetsSum", EmbeddingBagOffsetsSumNode::is_supported, |d| {
            Ok(AnyCpuNode::EmbeddingBagOffsetsSum(EmbeddingBagOffsetsSumNode::new(d)?))
        });
        registry.register("EmbeddingBagPackedSum", EmbeddingBagPackedSumNode::is_supported, |d| {
            Ok(AnyCpuNode::EmbeddingBagPackedSum(EmbeddingBagPackedSumNode::new(d)?))
        });
        registry.register("EmbeddingSegmentsSum", EmbeddingSegmentsSumNode::is_supported, |d| {
            Ok(AnyCpuNode::EmbeddingSegmentsSum(EmbeddingSegmentsSumNode::new(d)?))
        });
        for type_name in ["Reshape", "Squeeze", "Unsqueeze", "Flatten"] {
            registry.register(type_name, ReshapeNode::is_supported, |d| {
                Ok(AnyCpuNode::Reshape(ReshapeNode::new(d)?))
            });
        }
        registry
    }

    /// Adds a candidate implementation after any already registered for `type_name`.
    pub fn register(
        &mut self,
        type_name: &str,
        is_supported: impl Fn(&NodeDescription) -> Result<(), NodeError> + Send + Sync + 'static,
        constructor: impl Fn(&NodeDescription) -> Result<AnyCpuNode, NodeError> + Send + Sync + 'static,
    ) {
        self.entries.push(RegistryEntry {
            type_name: type_name.to_string(),
            is_supported: Box::new(is_supported),
            constructor: Box::new(constructor),
        });
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![];
        for entry in &self.entries {
            if !names.contains(&entry.type_name.as_str()) {
                names.push(&entry.type_name);
            }
        }
        names
    }

    fn candidates<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a RegistryEntry> + 'a {
        self.entries.iter().filter(move |e| e.type_name == type_name)
    }

    fn no_implementation(desc: &NodeDescription) -> NodeError {
        desc.unsupported(format!("no implementation registered for {}", desc.type_name))
    }

    /// Cheap check whether any registered implementation accepts `desc`.
    pub fn is_supported(&self, desc: &NodeDescription) -> Result<(), NodeError> {
        let mut first_error = None;
        for entry in self.candidates(&desc.type_name) {
            match (entry.is_supported)(desc) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| Self::no_implementation(desc)))
    }

    pub fn construct(&self, desc: &NodeDescription) -> Result<AnyCpuNode, NodeError> {
        let mut first_error = None;
        for (attempt, entry) in self.candidates(&desc.type_name).enumerate() {
            match (entry.is_supported)(desc).and_then(|()| (entry.constructor)(desc)) {
                Ok(node) => {
                    log::debug!("Constructed {} ({}) with candidate {}", desc.name, desc.type_name, attempt);
                    return Ok(node);
                }
                Err(err) => {
                    log::warn!("Candidate {} for {} ({}) rejected: {}", attempt, desc.name, desc.type_name, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| Self::no_implementation(desc)))
    }
}
