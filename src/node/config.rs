use crate::layout::LayoutDesc;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum ImplKind {
    Unknown,
    RefAny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    pub desc: LayoutDesc,
    /// Port on the other side of the node whose memory this one aliases.
    pub in_place: Option<usize>,
    pub constant: bool,
}

impl DataConfig {
    pub fn new(desc: LayoutDesc) -> Self {
        Self {
            desc,
            in_place: None,
            constant: false,
        }
    }

    pub fn constant(desc: LayoutDesc) -> Self {
        Self {
            desc,
            in_place: None,
            constant: true,
        }
    }

    pub fn in_place(desc: LayoutDesc, port: usize) -> Self {
        Self {
            desc,
            in_place: Some(port),
            constant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub inputs: Vec<DataConfig>,
    pub outputs: Vec<DataConfig>,
    pub dyn_batch_support: bool,
}

impl NodeConfig {
    /// First descriptor carrying non-zero padding, if any.
    pub fn find_padded(&self) -> Option<&LayoutDesc> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|c| &c.desc)
            .find(|d| !d.has_zero_padding())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveDescriptor {
    pub config: NodeConfig,
    pub impl_kind: ImplKind,
    pub preferred: LayoutDesc,
}

impl PrimitiveDescriptor {
    pub fn new(config: NodeConfig, impl_kind: ImplKind, preferred: LayoutDesc) -> Self {
        Self {
            config,
            impl_kind,
            preferred,
        }
    }
}
