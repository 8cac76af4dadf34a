pub mod blob;
pub mod config;
pub mod dtype;
pub mod layout;
pub mod node;
pub mod ops;
pub mod parallel;
pub mod registry;

pub use blob::{Blob, Memory};
pub use config::RuntimeConfig;
pub use dtype::DType;
pub use layout::{FormatKind, LayoutDesc};
pub use node::{CpuNode, Edge, NodeDescription, NodeError, PortRef, TensorDesc};
pub use ops::AnyCpuNode;
pub use parallel::{Dispatcher, ThreadingBackend};
pub use registry::NodeRegistry;
