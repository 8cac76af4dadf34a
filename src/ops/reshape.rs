use crate::layout::LayoutDesc;
use crate::node::{
    CpuNode, DataConfig, ImplKind, NodeBase, NodeConfig, NodeDescription, NodeError,
    PrimitiveDescriptor, plain_desc,
};
use crate::parallel::Dispatcher;

/// Reshape, Squeeze, Unsqueeze and Flatten: same bytes, new dims.
#[derive(Debug)]
pub struct ReshapeNode {
    base: NodeBase,
}

impl ReshapeNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        desc.check_port_counts(1..=2, 1)?;
        if desc.inputs[1..].iter().any(|t| !t.constant) {
            return Err(desc.unsupported("only a constant shape input is supported"));
        }
        let input = &desc.inputs[0];
        let output = &desc.outputs[0];
        if input.element_count() != output.element_count() {
            return Err(desc.unsupported(format!(
                "cannot view {:?} as {:?}",
                input.dims, output.dims
            )));
        }
        Ok(())
    }

    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        Self::is_supported(desc)?;
        Ok(Self {
            base: NodeBase::new(desc),
        })
    }
}

impl CpuNode for ReshapeNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn init_supported_primitive_descriptors(&self) -> Result<Vec<PrimitiveDescriptor>, NodeError> {
        let desc = self.base.description();
        let input = plain_desc(&desc.inputs[0]);
        let output = LayoutDesc::plain(input.dtype(), &desc.outputs[0].dims);
        let mut inputs = vec![DataConfig::new(input.clone())];
        inputs.extend(desc.inputs[1..].iter().map(|t| DataConfig::constant(plain_desc(t))));
        let config = NodeConfig {
            inputs,
            outputs: vec![DataConfig::in_place(output, 0)],
            dyn_batch_support: false,
        };
        Ok(vec![PrimitiveDescriptor::new(config, ImplKind::Unknown, input)])
    }

    fn execute(&self, _dispatcher: &Dispatcher, _batch: Option<usize>) -> Result<(), NodeError> {
        self.base.check_prepared()?;
        let out_desc = self.base.selected_config()?.outputs[0].desc.clone();
        let memory = self.base.input_memory(0)?.clone().with_desc(out_desc)?;
        log::trace!("{} {}: publishing {}", self.base.type_name(), self.base.name(), memory.desc());
        self.base.output_edge(0)?.set_memory(memory);
        Ok(())
    }
}
