use crate::blob::SharedSliceMut;
use crate::layout::{FormatKind, LayoutDesc, Odometer, channel_blockings};
use crate::node::{
    CpuNode, DataConfig, ImplKind, NodeBase, NodeConfig, NodeDescription, NodeError,
    PrimitiveDescriptor, batch_to_process, plain_desc,
};
use crate::parallel::Dispatcher;
use serde::{Deserialize, Serialize};

const MAX_RANK: usize = 5;
const CHANNEL_AXIS: usize = 1;

/// Where every output axis reads from, resolved once from begin values and masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropParams {
    /// Start offset along each input axis.
    pub input_offsets: Vec<usize>,
    /// Input axis feeding each output axis, `None` for inserted unit axes.
    pub output_to_input: Vec<Option<usize>>,
}

fn mask_bit(mask: Option<&[i64]>, axis: usize) -> bool {
    mask.and_then(|m| m.get(axis)).is_some_and(|&v| v != 0)
}

impl CropParams {
    pub fn parse(desc: &NodeDescription) -> Result<Self, NodeError> {
        desc.check_port_counts(1..=4, 1)?;
        if desc.inputs[1..].iter().any(|input| !input.constant) {
            return Err(desc.unsupported("begin, end and stride inputs must be constant"));
        }
        let attrs = &desc.attributes;
        let begin = attrs
            .ints("begin")
            .ok_or_else(|| desc.unsupported("missing \"begin\" attribute"))?;
        if let Some(strides) = attrs.ints("strides") {
            if strides.iter().any(|&s| s != 1) {
                return Err(desc.unsupported("only unit strides are supported"));
            }
        }
        let begin_mask = attrs.ints("begin_mask");
        let shrink_mask = attrs.ints("shrink_axis_mask");
        let new_axis_mask = attrs.ints("new_axis_mask");
        let ellipsis_mask = attrs.ints("ellipsis_mask");

        let in_dims = &desc.inputs[0].dims;
        let out_dims = &desc.outputs[0].dims;
        let in_rank = in_dims.len();
        if in_rank == 0 || in_rank > MAX_RANK || out_dims.is_empty() || out_dims.len() > MAX_RANK {
            return Err(desc.unsupported(format!(
                "input rank {} and output rank {} must be within 1..={MAX_RANK}",
                in_rank,
                out_dims.len()
            )));
        }
        let ellipsis_count = (0..begin.len()).filter(|&a| mask_bit(ellipsis_mask, a)).count();
        if ellipsis_count > 1 {
            return Err(desc.unsupported("only one bit of the ellipsis mask may be set"));
        }

        let mut input_offsets = vec![0usize; in_rank];
        let mut output_to_input = vec![];
        let mut input_axis = 0usize;
        let out_of_axes = || desc.unsupported("begin values address more axes than the input has");

        for axis in 0..begin.len() {
            if mask_bit(ellipsis_mask, axis) {
                let inputs_before = (0..axis).filter(|&i| !mask_bit(new_axis_mask, i)).count();
                let new_after = (axis + 1..begin.len())
                    .filter(|&i| mask_bit(new_axis_mask, i))
                    .count();
                let inputs_after = begin.len() - axis - new_after - 1;
                let hidden = in_rank
                    .checked_sub(inputs_after + inputs_before)
                    .ok_or_else(out_of_axes)?;
                for _ in 0..hidden {
                    output_to_input.push(Some(input_axis));
                    input_axis += 1;
                }
            } else if mask_bit(new_axis_mask, axis) {
                output_to_input.push(None);
            } else {
                let extent = *in_dims.get(input_axis).ok_or_else(out_of_axes)? as i64;
                // Begin mask applies to regular axes as well as shrunk ones.
                let lb = if mask_bit(begin_mask, axis) { 0 } else { begin[axis] };
                if mask_bit(shrink_mask, axis) {
                    let lb = if lb < 0 { lb + extent } else { lb };
                    if lb < 0 || lb >= extent {
                        return Err(desc.unsupported(format!(
                            "shrunk axis {axis} begins at {lb}, outside of extent {extent}"
                        )));
                    }
                    input_offsets[input_axis] = lb as usize;
                } else {
                    let lb = if lb < 0 { (lb + extent).max(0) } else { lb };
                    input_offsets[input_axis] = lb.min(extent) as usize;
                    output_to_input.push(Some(input_axis));
                }
                input_axis += 1;
            }
        }
        if input_axis > in_rank {
            return Err(out_of_axes());
        }
        output_to_input.extend((input_axis..in_rank).map(Some));

        if output_to_input.len() != out_dims.len() {
            return Err(desc.unsupported(format!(
                "masks produce rank {}, output has rank {}",
                output_to_input.len(),
                out_dims.len()
            )));
        }
        for (out_axis, mapped) in output_to_input.iter().enumerate() {
            let fits = match mapped {
                Some(i) => input_offsets[*i] + out_dims[out_axis] <= in_dims[*i],
                None => out_dims[out_axis] == 1,
            };
            if !fits {
                return Err(desc.unsupported(format!(
                    "output axis {out_axis} of extent {} does not fit the input",
                    out_dims[out_axis]
                )));
            }
        }
        Ok(Self {
            input_offsets,
            output_to_input,
        })
    }

    /// Output axes map one to one onto input axes.
    fn is_identity(&self) -> bool {
        self.output_to_input.len() == self.input_offsets.len()
            && self
                .output_to_input
                .iter()
                .enumerate()
                .all(|(o, i)| *i == Some(o))
    }
}

#[derive(Debug)]
pub struct CropNode {
    base: NodeBase,
    params: CropParams,
}

impl CropNode {
    pub fn is_supported(desc: &NodeDescription) -> Result<(), NodeError> {
        CropParams::parse(desc).map(|_| ())
    }

    pub fn new(desc: &NodeDescription) -> Result<Self, NodeError> {
        let params = CropParams::parse(desc)?;
        Ok(Self {
            base: NodeBase::new(desc),
            params,
        })
    }

    pub fn params(&self) -> &CropParams {
        &self.params
    }

    /// Channel blockings usable without padding and without splitting a block.
    fn blockings(&self) -> Vec<usize> {
        let desc = self.base.description();
        let in_dims = &desc.inputs[0].dims;
        let out_dims = &desc.outputs[0].dims;
        if !matches!(in_dims.len(), 4 | 5) || !self.params.is_identity() {
            return vec![];
        }
        let offset = self.params.input_offsets[CHANNEL_AXIS];
        channel_blockings(in_dims, CHANNEL_AXIS)
            .into_iter()
            .filter(|b| out_dims[CHANNEL_AXIS] % b == 0 && offset % b == 0)
            .collect()
    }
}

impl CpuNode for CropNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn init_supported_primitive_descriptors(&self) -> Result<Vec<PrimitiveDescriptor>, NodeError> {
        let desc = self.base.description();
        // Crop only moves data, the output keeps the input precision.
        let dtype = desc.inputs[0].dtype;
        let in_dims = &desc.inputs[0].dims;
        let out_dims = &desc.outputs[0].dims;

        let mut formats: Vec<FormatKind> = self
            .blockings()
            .into_iter()
            .map(|block| FormatKind::Blocked {
                axis: CHANNEL_AXIS,
                block,
            })
            .collect();
        formats.push(FormatKind::Plain);
        // A runtime batch limit only makes sense while output axis 0 is the input batch.
        let dyn_batch_support = out_dims.len() >= 2 && self.params.output_to_input[0] == Some(0);

        formats
            .into_iter()
            .map(|format| {
                let in_desc = LayoutDesc::with_format(dtype, in_dims, format)?;
                let out_desc = LayoutDesc::with_format(dtype, out_dims, format)?;
                let mut inputs = vec![DataConfig::new(in_desc.clone())];
                inputs.extend(desc.inputs[1..].iter().map(|t| DataConfig::constant(plain_desc(t))));
                let config = NodeConfig {
                    inputs,
                    outputs: vec![DataConfig::new(out_desc)],
                    dyn_batch_support,
                };
                Ok(PrimitiveDescriptor::new(config, ImplKind::Unknown, in_desc))
            })
            .collect()
    }

    fn execute(&self, dispatcher: &Dispatcher, batch: Option<usize>) -> Result<(), NodeError> {
        self.base.check_prepared()?;
        let config = self.base.selected_config()?;
        let input = self.base.input_memory(0)?;
        let mut output = self.base.output_memory(0)?;

        let in_desc = input.desc().clone();
        let out_desc = output.desc().clone();
        let block = in_desc.block_size();
        let item = in_desc.dtype().size();
        let in_dims = in_desc.dims();
        let out_dims = out_desc.dims().to_vec();
        let out_rank = out_dims.len();
        let offsets = &self.params.input_offsets;
        let mapping = &self.params.output_to_input;

        let batch = if out_rank >= 2 {
            batch_to_process(config, out_dims[0], batch)
        } else {
            out_dims[0]
        };

        let src = input.blob().as_bytes();
        let dst = SharedSliceMut::new(output.blob_mut().as_bytes_mut());

        let spatial_is_unit = |dims: &[usize]| dims.iter().skip(2).all(|&d| d == 1);
        if out_rank >= 2 && self.params.is_identity() && spatial_is_unit(in_dims) && spatial_is_unit(&out_dims) {
            let oc = out_dims[1];
            let ic = in_dims[1];
            log::trace!("Crop {}: {} contiguous runs of {} elements", self.base.name(), batch, oc);
            dispatcher.parallel_for(batch, |n| {
                let s = ((n + offsets[0]) * ic + offsets[1]) * item;
                // SAFETY: each batch entry owns its own run of the output.
                let d = unsafe { dst.slice_mut(n * oc * item, oc * item) };
                d.copy_from_slice(&src[s..s + oc * item]);
            });
            return Ok(());
        }

        // Work in units of blocks along the channel axis.
        let to_units = |axis: usize, value: usize| if axis == CHANNEL_AXIS { value / block } else { value };
        let in_strides = in_desc.strides();
        let out_strides = out_desc.strides();
        let out_units: Vec<usize> = out_dims.iter().enumerate().map(|(a, &d)| to_units(a, d)).collect();

        let last = out_rank - 1;
        let run_len = out_units[last] * block;
        let src_step = match mapping[last] {
            Some(i) if i + 1 != in_dims.len() => Some(in_strides[i]),
            _ => None,
        };
        let src_base: usize = offsets
            .iter()
            .enumerate()
            .map(|(i, &off)| to_units(i, off) * in_strides[i])
            .sum();

        let (d0, d1) = match out_rank {
            1 => (1, 1),
            2 => (batch, 1),
            _ => (batch, out_units[1]),
        };
        let inner_dims: Vec<usize> = if out_rank > 2 { out_units[2..last].to_vec() } else { vec![] };
        log::trace!(
            "Crop {}: {}x{} partitions, rows of {} elements, layout {}",
            self.base.name(),
            d0,
            d1,
            run_len,
            in_desc.format_tag()
        );

        dispatcher.parallel_for2d(d0, d1, |n, c| {
            let mut prefix = [0usize; MAX_RANK];
            if out_rank >= 2 {
                prefix[0] = n;
            }
            if out_rank >= 3 {
                prefix[1] = c;
            }
            let mut odometer = Odometer::new(&inner_dims);
            while let Some(inner) = odometer.index() {
                prefix[2..2 + inner.len()].copy_from_slice(inner);
                let mut s = src_base;
                let mut d = 0;
                for (o, &coord) in prefix[..last].iter().enumerate() {
                    d += coord * out_strides[o];
                    if let Some(i) = mapping[o] {
                        s += coord * in_strides[i];
                    }
                }
                // SAFETY: rows are disjoint across (n, c) partitions and inner positions.
                let row = unsafe { dst.slice_mut(d * item, run_len * item) };
                match src_step {
                    None => row.copy_from_slice(&src[s * item..(s + run_len) * item]),
                    Some(step) => {
                        for (k, out) in row.chunks_exact_mut(item).enumerate() {
                            let at = (s + k * step) * item;
                            out.copy_from_slice(&src[at..at + item]);
                        }
                    }
                }
                odometer.advance();
            }
        });
        Ok(())
    }
}
