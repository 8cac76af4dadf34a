//! Per-operator lifecycle: enumerate candidate configurations, validate and
//! commit one, prepare buffers, then execute any number of times.
mod attributes;
mod config;
mod edge;

pub use attributes::{Attribute, Attributes};
pub use config::{DataConfig, ImplKind, NodeConfig, PrimitiveDescriptor};
pub use edge::{Edge, PortRef};

use crate::blob::{BlobError, Memory};
use crate::dtype::{DType, DTypeError};
use crate::layout::{LayoutDesc, LayoutError};
use crate::parallel::Dispatcher;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Unsupported operation {0}: {1}")]
    UnsupportedOperation(String, String),
    #[error("Configuration error for node {0}: {1}")]
    ConfigurationError(String, String),
    #[error("Allocation error for node {0}: {1}")]
    AllocationError(String, String),
    #[error("Node {node}: {what} value {value} is out of range [0, {bound})")]
    IndexOutOfRange {
        node: String,
        what: &'static str,
        value: i64,
        bound: usize,
    },
    #[error(transparent)]
    LayoutError(#[from] LayoutError),
    #[error(transparent)]
    BlobError(#[from] BlobError),
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: DType,
    pub dims: Vec<usize>,
    /// Value is fixed when the graph is built (axes, shapes, begin/end lists).
    pub constant: bool,
}

impl TensorDesc {
    pub fn new(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            constant: false,
        }
    }

    pub fn constant(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            constant: true,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

/// What the graph hands over for one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub type_name: String,
    pub name: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub attributes: Attributes,
}

impl NodeDescription {
    pub fn new(type_name: &str, name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            name: name.to_string(),
            inputs: vec![],
            outputs: vec![],
            attributes: Attributes::new(),
        }
    }

    pub fn with_input(mut self, input: TensorDesc) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: TensorDesc) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Attribute>) -> Self {
        self.attributes.set(name, value);
        self
    }

    pub(crate) fn unsupported(&self, message: impl Into<String>) -> NodeError {
        NodeError::UnsupportedOperation(
            format!("{} ({})", self.name, self.type_name),
            message.into(),
        )
    }

    pub(crate) fn check_port_counts(
        &self,
        inputs: std::ops::RangeInclusive<usize>,
        outputs: usize,
    ) -> Result<(), NodeError> {
        if !inputs.contains(&self.inputs.len()) || self.outputs.len() != outputs {
            return Err(self.unsupported(format!(
                "has incorrect number of input/output edges: {} inputs, {} outputs",
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(())
    }
}

/// Read access to a port's memory, checked to be allocated.
pub struct MemoryRef<'a>(RwLockReadGuard<'a, Option<Memory>>);

impl Deref for MemoryRef<'_> {
    type Target = Memory;
    fn deref(&self) -> &Memory {
        match self.0.as_ref() {
            Some(memory) => memory,
            None => unreachable!(),
        }
    }
}

/// Write access to a port's memory, checked to be allocated.
pub struct MemoryMut<'a>(RwLockWriteGuard<'a, Option<Memory>>);

impl Deref for MemoryMut<'_> {
    type Target = Memory;
    fn deref(&self) -> &Memory {
        match self.0.as_ref() {
            Some(memory) => memory,
            None => unreachable!(),
        }
    }
}

impl DerefMut for MemoryMut<'_> {
    fn deref_mut(&mut self) -> &mut Memory {
        match self.0.as_mut() {
            Some(memory) => memory,
            None => unreachable!(),
        }
    }
}

/// State every node carries regardless of operator kind.
#[derive(Debug)]
pub struct NodeBase {
    description: NodeDescription,
    input_edges: Vec<Option<Arc<Edge>>>,
    output_edges: Vec<Option<Arc<Edge>>>,
    descriptors: Option<Vec<PrimitiveDescriptor>>,
    selected: Option<PrimitiveDescriptor>,
    prepared: bool,
}

impl NodeBase {
    pub fn new(description: &NodeDescription) -> Self {
        Self {
            input_edges: vec![None; description.inputs.len()],
            output_edges: vec![None; description.outputs.len()],
            description: description.clone(),
            descriptors: None,
            selected: None,
            prepared: false,
        }
    }

    pub fn description(&self) -> &NodeDescription {
        &self.description
    }

    pub fn type_name(&self) -> &str {
        &self.description.type_name
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn supported_primitive_descriptors(&self) -> Option<&[PrimitiveDescriptor]> {
        self.descriptors.as_deref()
    }

    pub fn selected_primitive_descriptor(&self) -> Option<&PrimitiveDescriptor> {
        self.selected.as_ref()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn configuration_error(&self, message: impl Into<String>) -> NodeError {
        NodeError::ConfigurationError(self.name().to_string(), message.into())
    }

    pub(crate) fn allocation_error(&self, message: impl Into<String>) -> NodeError {
        NodeError::AllocationError(self.name().to_string(), message.into())
    }

    pub(crate) fn index_error(&self, what: &'static str, value: i64, bound: usize) -> NodeError {
        NodeError::IndexOutOfRange {
            node: self.name().to_string(),
            what,
            value,
            bound,
        }
    }

    pub fn attach_input(&mut self, port: usize, edge: Arc<Edge>) -> Result<(), NodeError> {
        let slot = self
            .input_edges
            .get_mut(port)
            .ok_or_else(|| NodeError::ConfigurationError(self.description.name.clone(), format!("no input port {port}")))?;
        *slot = Some(edge);
        self.prepared = false;
        Ok(())
    }

    pub fn attach_output(&mut self, port: usize, edge: Arc<Edge>) -> Result<(), NodeError> {
        let slot = self
            .output_edges
            .get_mut(port)
            .ok_or_else(|| NodeError::ConfigurationError(self.description.name.clone(), format!("no output port {port}")))?;
        *slot = Some(edge);
        self.prepared = false;
        Ok(())
    }

    pub fn input_edge(&self, port: usize) -> Result<&Arc<Edge>, NodeError> {
        self.input_edges
            .get(port)
            .and_then(|e| e.as_ref())
            .ok_or_else(|| self.allocation_error(format!("input port {port} has no edge")))
    }

    pub fn output_edge(&self, port: usize) -> Result<&Arc<Edge>, NodeError> {
        self.output_edges
            .get(port)
            .and_then(|e| e.as_ref())
            .ok_or_else(|| self.allocation_error(format!("output port {port} has no edge")))
    }

    /// Fails unless `memory` matches the descriptor committed for the port.
    /// Constant inputs and in-place outputs are not checked.
    fn check_committed(&self, memory: &Memory, port: usize, is_input: bool) -> Result<(), NodeError> {
        let Some(selected) = &self.selected else {
            return Ok(());
        };
        let (direction, configs) = if is_input {
            ("input", &selected.config.inputs)
        } else {
            ("output", &selected.config.outputs)
        };
        let Some(data_config) = configs.get(port) else {
            return Ok(());
        };
        if data_config.constant || data_config.in_place.is_some() || memory.desc() == &data_config.desc {
            return Ok(());
        }
        Err(self.allocation_error(format!(
            "{direction} {port} holds {} but {} was committed",
            memory.desc(),
            data_config.desc
        )))
    }

    pub(crate) fn input_memory(&self, port: usize) -> Result<MemoryRef<'_>, NodeError> {
        let guard = self.input_edge(port)?.read();
        match guard.as_ref() {
            Some(memory) => self.check_committed(memory, port, true)?,
            None => return Err(self.allocation_error(format!("input memory on port {port} is not allocated"))),
        }
        Ok(MemoryRef(guard))
    }

    pub(crate) fn output_memory(&self, port: usize) -> Result<MemoryMut<'_>, NodeError> {
        let guard = self.output_edge(port)?.write();
        match guard.as_ref() {
            Some(memory) => self.check_committed(memory, port, false)?,
            None => return Err(self.allocation_error(format!("output memory on port {port} is not allocated"))),
        }
        Ok(MemoryMut(guard))
    }

    pub(crate) fn set_descriptors(&mut self, descriptors: Vec<PrimitiveDescriptor>) {
        self.descriptors = Some(descriptors);
    }

    pub fn selected_config(&self) -> Result<&NodeConfig, NodeError> {
        self.selected
            .as_ref()
            .map(|pd| &pd.config)
            .ok_or_else(|| self.configuration_error("preferable primitive descriptor is not set"))
    }

    /// Rejects configurations the rest of the runtime cannot represent.
    pub fn validate(&self, candidate: &PrimitiveDescriptor) -> Result<(), NodeError> {
        let config = &candidate.config;
        if config.inputs.len() != self.input_edges.len() || config.outputs.len() != self.output_edges.len() {
            return Err(self.configuration_error(format!(
                "configuration has {} inputs and {} outputs, node has {} and {}",
                config.inputs.len(),
                config.outputs.len(),
                self.input_edges.len(),
                self.output_edges.len()
            )));
        }
        if let Some(desc) = config.find_padded() {
            return Err(self.configuration_error(format!("descriptor {desc} has non-zero padding")));
        }
        Ok(())
    }

    pub fn commit(&mut self, candidate: &PrimitiveDescriptor) -> Result<(), NodeError> {
        self.validate(candidate)?;
        if let Some(selected) = &self.selected {
            if selected == candidate {
                return Ok(());
            }
            return Err(self.configuration_error("a different configuration is already committed"));
        }
        let offered = self
            .descriptors
            .as_ref()
            .is_some_and(|d| d.contains(candidate));
        if !offered {
            return Err(self.configuration_error("configuration was not offered by the node"));
        }
        log::debug!(
            "Node {} ({}) committed {} with {}",
            self.name(),
            self.type_name(),
            candidate.preferred.format_tag(),
            candidate.impl_kind
        );
        self.selected = Some(candidate.clone());
        Ok(())
    }

    /// Checks inputs against the committed configuration and allocates every
    /// output that does not alias an input.
    pub fn prepare(&mut self) -> Result<(), NodeError> {
        let config = self.selected_config()?.clone();
        for (port, data_config) in config.inputs.iter().enumerate() {
            if !data_config.constant {
                self.input_memory(port)?;
            }
        }
        for (port, data_config) in config.outputs.iter().enumerate() {
            let edge = self.output_edge(port)?;
            if data_config.in_place.is_some() {
                continue;
            }
            let mut guard = edge.write();
            let reuse = guard.as_ref().is_some_and(|m| m.desc() == &data_config.desc);
            if !reuse {
                *guard = Some(Memory::zeros(data_config.desc.clone()));
            }
        }
        self.prepared = true;
        Ok(())
    }

    pub(crate) fn check_prepared(&self) -> Result<(), NodeError> {
        if !self.prepared {
            return Err(self.allocation_error("execute called before prepare"));
        }
        Ok(())
    }
}

/// Operator node capability set.
pub trait CpuNode {
    fn base(&self) -> &NodeBase;
    fn base_mut(&mut self) -> &mut NodeBase;

    /// Candidate configurations, best first. Called once per node.
    fn init_supported_primitive_descriptors(&self) -> Result<Vec<PrimitiveDescriptor>, NodeError>;

    /// Runs the kernel. `batch` limits the leading axis when the committed
    /// configuration supports a dynamic batch.
    fn execute(&self, dispatcher: &Dispatcher, batch: Option<usize>) -> Result<(), NodeError>;

    fn prepare(&mut self) -> Result<(), NodeError> {
        self.base_mut().prepare()
    }

    fn type_name(&self) -> &str {
        self.base().type_name()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn enumerate(&mut self) -> Result<&[PrimitiveDescriptor], NodeError> {
        if self.base().supported_primitive_descriptors().is_none() {
            let descriptors = self.init_supported_primitive_descriptors()?;
            log::debug!(
                "Node {} ({}) offers {:?}",
                self.name(),
                self.type_name(),
                descriptors.iter().map(|d| d.preferred.format_tag()).collect::<Vec<_>>()
            );
            self.base_mut().set_descriptors(descriptors);
        }
        Ok(self.base().supported_primitive_descriptors().unwrap_or_default())
    }

    fn validate(&self, candidate: &PrimitiveDescriptor) -> Result<(), NodeError> {
        self.base().validate(candidate)
    }

    fn commit(&mut self, candidate: &PrimitiveDescriptor) -> Result<(), NodeError> {
        self.enumerate()?;
        self.base_mut().commit(candidate)
    }

    /// Commits the first enumerated candidate that `accept` agrees with.
    fn select_preferred(&mut self, accept: &dyn Fn(&PrimitiveDescriptor) -> bool) -> Result<PrimitiveDescriptor, NodeError> {
        let chosen = self.enumerate()?.iter().find(|pd| accept(pd)).cloned();
        let chosen = chosen
            .ok_or_else(|| self.base().configuration_error("no candidate configuration was accepted"))?;
        self.commit(&chosen)?;
        Ok(chosen)
    }

    fn attach_input(&mut self, port: usize, edge: Arc<Edge>) -> Result<(), NodeError> {
        self.base_mut().attach_input(port, edge)
    }

    fn attach_output(&mut self, port: usize, edge: Arc<Edge>) -> Result<(), NodeError> {
        self.base_mut().attach_output(port, edge)
    }
}

/// Plain descriptor for a described tensor.
pub(crate) fn plain_desc(tensor: &TensorDesc) -> LayoutDesc {
    LayoutDesc::plain(tensor.dtype, &tensor.dims)
}

/// Batch entries to process: the runtime limit if the config allows one.
pub(crate) fn batch_to_process(config: &NodeConfig, full: usize, batch: Option<usize>) -> usize {
    match batch {
        Some(b) if config.dyn_batch_support => b.min(full),
        _ => full,
    }
}
