//! Physical layout descriptors.
//!
//! A [`LayoutDesc`] maps a logical shape onto memory. Plain layouts are dense
//! row-major. Blocked layouts split one axis (conventionally the channel axis)
//! into `dims[axis] / block` outer steps and append the block as the innermost
//! physical axis, so `nChw8c` stores eight consecutive channels per spatial
//! position.
use crate::dtype::DType;
use serde::{Deserialize, Serialize};

/// Block sizes a node may offer on its channel axis, most specialized first.
pub const CHANNEL_BLOCK_SIZES: [usize; 2] = [16, 8];

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("Axis {0} is out of range for rank {1}")]
    AxisOutOfRange(usize, usize),
    #[error("Dimension {dim} on axis {axis} is not divisible by block {block}")]
    NotDivisible { axis: usize, dim: usize, block: usize },
    #[error("Invalid block size {0}")]
    InvalidBlock(usize),
    #[error("Padding rank {0} does not match tensor rank {1}")]
    PaddingRankMismatch(usize, usize),
    #[error("Cannot reorder between {0} and {1}")]
    IncompatibleLayouts(String, String),
    #[error("Coordinate {0:?} is outside of {1:?}")]
    CoordinateOutOfRange(Vec<usize>, Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatKind {
    Plain,
    Blocked { axis: usize, block: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutDesc {
    dtype: DType,
    dims: Vec<usize>,
    format: FormatKind,
    offset_padding_to_data: Vec<usize>,
    offset_padding: usize,
}

impl LayoutDesc {
    pub fn plain(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            format: FormatKind::Plain,
            offset_padding_to_data: vec![0; dims.len()],
            offset_padding: 0,
        }
    }

    pub fn blocked(dtype: DType, dims: &[usize], axis: usize, block: usize) -> Result<Self, LayoutError> {
        if axis >= dims.len() {
            return Err(LayoutError::AxisOutOfRange(axis, dims.len()));
        }
        if block < 2 {
            return Err(LayoutError::InvalidBlock(block));
        }
        if dims[axis] % block != 0 {
            return Err(LayoutError::NotDivisible {
                axis,
                dim: dims[axis],
                block,
            });
        }
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            format: FormatKind::Blocked { axis, block },
            offset_padding_to_data: vec![0; dims.len()],
            offset_padding: 0,
        })
    }

    pub fn with_format(dtype: DType, dims: &[usize], format: FormatKind) -> Result<Self, LayoutError> {
        match format {
            FormatKind::Plain => Ok(Self::plain(dtype, dims)),
            FormatKind::Blocked { axis, block } => Self::blocked(dtype, dims, axis, block),
        }
    }

    /// Attaches padding offsets. No node accepts such a descriptor at commit
    /// time, but negotiation may be handed one by a neighbour.
    pub fn with_padding(mut self, offset_padding_to_data: Vec<usize>, offset_padding: usize) -> Result<Self, LayoutError> {
        if offset_padding_to_data.len() != self.dims.len() {
            return Err(LayoutError::PaddingRankMismatch(
                offset_padding_to_data.len(),
                self.dims.len(),
            ));
        }
        self.offset_padding_to_data = offset_padding_to_data;
        self.offset_padding = offset_padding;
        Ok(self)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn format(&self) -> FormatKind {
        self.format
    }

    pub fn is_plain(&self) -> bool {
        self.format == FormatKind::Plain
    }

    pub fn block_size(&self) -> usize {
        match self.format {
            FormatKind::Plain => 1,
            FormatKind::Blocked { block, .. } => block,
        }
    }

    pub fn offset_padding_to_data(&self) -> &[usize] {
        &self.offset_padding_to_data
    }

    pub fn offset_padding(&self) -> usize {
        self.offset_padding
    }

    pub fn has_zero_padding(&self) -> bool {
        self.offset_padding == 0 && self.offset_padding_to_data.iter().all(|&x| x == 0)
    }

    /// Same precision and logical dims, any physical format.
    pub fn same_logical(&self, other: &LayoutDesc) -> bool {
        self.dtype == other.dtype && self.dims == other.dims
    }

    /// Physical dims, outermost first. For blocked formats the block becomes
    /// the innermost axis.
    pub fn blocked_dims(&self) -> Vec<usize> {
        let mut out = self.dims.clone();
        if let FormatKind::Blocked { axis, block } = self.format {
            out[axis] /= block;
            out.push(block);
        }
        out
    }

    /// Dense row-major strides over [`Self::blocked_dims`], in elements.
    pub fn strides(&self) -> Vec<usize> {
        dense_strides(&self.blocked_dims())
    }

    pub fn element_count(&self) -> usize {
        self.blocked_dims().iter().product()
    }

    pub fn byte_size(&self) -> usize {
        (self.offset_padding + self.element_count()) * self.dtype.size()
    }

    /// Element offset of a logical coordinate.
    pub fn physical_offset(&self, coord: &[usize]) -> Result<usize, LayoutError> {
        if coord.len() != self.dims.len() || coord.iter().zip(&self.dims).any(|(c, d)| c >= d) {
            return Err(LayoutError::CoordinateOutOfRange(coord.to_vec(), self.dims.clone()));
        }
        let strides = self.strides();
        let mut offset = self.offset_padding;
        for (axis, (&c, &pad)) in coord.iter().zip(&self.offset_padding_to_data).enumerate() {
            let c = c + pad;
            match self.format {
                FormatKind::Blocked { axis: b_axis, block } if b_axis == axis => {
                    offset += (c / block) * strides[axis] + (c % block);
                }
                _ => offset += c * strides[axis],
            }
        }
        Ok(offset)
    }

    pub fn format_tag(&self) -> String {
        let rank = self.dims.len();
        match self.format {
            FormatKind::Plain => match rank {
                1 => "x".to_string(),
                2 => "nc".to_string(),
                3 => "ncw".to_string(),
                4 => "nchw".to_string(),
                5 => "ncdhw".to_string(),
                _ => format!("plain{rank}"),
            },
            FormatKind::Blocked { axis: 1, block } => match rank {
                3 => format!("nCw{block}c"),
                4 => format!("nChw{block}c"),
                5 => format!("nCdhw{block}c"),
                _ => format!("blocked1:{block}"),
            },
            FormatKind::Blocked { axis, block } => format!("blocked{axis}:{block}"),
        }
    }
}

impl std::fmt::Display for LayoutDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}:{}", self.dtype, self.dims, self.format_tag())
    }
}

pub fn dense_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Block sizes from [`CHANNEL_BLOCK_SIZES`] that divide `dims[axis]` evenly.
pub fn channel_blockings(dims: &[usize], axis: usize) -> Vec<usize> {
    match dims.get(axis) {
        Some(&channels) if channels > 0 => CHANNEL_BLOCK_SIZES
            .iter()
            .copied()
            .filter(|block| channels % block == 0)
            .collect(),
        _ => vec![],
    }
}

/// Multi-index counter over `dims`, last axis fastest.
#[derive(Debug, Clone)]
pub struct Odometer {
    dims: Vec<usize>,
    index: Vec<usize>,
    exhausted: bool,
}

impl Odometer {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            index: vec![0; dims.len()],
            exhausted: dims.contains(&0),
        }
    }

    pub fn index(&self) -> Option<&[usize]> {
        if self.exhausted {
            None
        } else {
            Some(&self.index)
        }
    }

    pub fn advance(&mut self) {
        for axis in (0..self.dims.len()).rev() {
            self.index[axis] += 1;
            if self.index[axis] < self.dims[axis] {
                return;
            }
            self.index[axis] = 0;
        }
        self.exhausted = true;
    }
}

pub fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    let mut odometer = Odometer::new(dims);
    while let Some(index) = odometer.index() {
        f(index);
        odometer.advance();
    }
}
