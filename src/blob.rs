use crate::dtype::{DType, DTypeOfPrimitive};
use crate::layout::{LayoutDesc, LayoutError, Odometer};
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Requested dtype {0}, but had dtype {1}")]
    WrongDTypeError(DType, DType),
    #[error("Blob holds {0} elements but layout {1} needs {2}")]
    SizeMismatch(usize, String, usize),
    #[error("Dtype {0} cannot be read as indices")]
    NotAnIndexType(DType),
    #[error(transparent)]
    LayoutError(#[from] LayoutError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// Owned, typed element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Blob {
    F64(Vec<f64>),
    F32(Vec<f32>),
    BF16(Vec<bf16>),
    F16(Vec<f16>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    U8(Vec<u8>),
    I8(Vec<i8>),
}

macro_rules! blob_apply {
    ($blob:expr, $x:ident => $body:expr) => {
        match $blob {
            Blob::F64($x) => $body,
            Blob::F32($x) => $body,
            Blob::BF16($x) => $body,
            Blob::F16($x) => $body,
            Blob::I64($x) => $body,
            Blob::I32($x) => $body,
            Blob::U8($x) => $body,
            Blob::I8($x) => $body,
        }
    };
}

pub trait BlobElement: Sized + Copy + Send + Sync + DTypeOfPrimitive + bytemuck::Pod {
    fn wrap(v: Vec<Self>) -> Blob;
    fn slice(blob: &Blob) -> Option<&[Self]>;
    fn slice_mut(blob: &mut Blob) -> Option<&mut [Self]>;
}

macro_rules! impl_blob_element {
    ($t:ty, $variant:ident) => {
        impl BlobElement for $t {
            fn wrap(v: Vec<Self>) -> Blob {
                Blob::$variant(v)
            }
            fn slice(blob: &Blob) -> Option<&[Self]> {
                if let Blob::$variant(x) = blob { Some(x) } else { None }
            }
            fn slice_mut(blob: &mut Blob) -> Option<&mut [Self]> {
                if let Blob::$variant(x) = blob { Some(x) } else { None }
            }
        }
    };
}

impl_blob_element!(f64, F64);
impl_blob_element!(f32, F32);
impl_blob_element!(bf16, BF16);
impl_blob_element!(f16, F16);
impl_blob_element!(i64, I64);
impl_blob_element!(i32, I32);
impl_blob_element!(u8, U8);
impl_blob_element!(i8, I8);

impl Blob {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F64 => Blob::F64(vec![0.0; len]),
            DType::F32 => Blob::F32(vec![0.0; len]),
            DType::BF16 => Blob::BF16(vec![bf16::ZERO; len]),
            DType::F16 => Blob::F16(vec![f16::ZERO; len]),
            DType::I64 => Blob::I64(vec![0; len]),
            DType::I32 => Blob::I32(vec![0; len]),
            DType::U8 => Blob::U8(vec![0; len]),
            DType::I8 => Blob::I8(vec![0; len]),
        }
    }

    pub fn from_vec<T: BlobElement>(v: Vec<T>) -> Self {
        T::wrap(v)
    }

    pub fn dtype(&self) -> DType {
        match self {
            Blob::F64(_) => DType::F64,
            Blob::F32(_) => DType::F32,
            Blob::BF16(_) => DType::BF16,
            Blob::F16(_) => DType::F16,
            Blob::I64(_) => DType::I64,
            Blob::I32(_) => DType::I32,
            Blob::U8(_) => DType::U8,
            Blob::I8(_) => DType::I8,
        }
    }

    pub fn len(&self) -> usize {
        blob_apply!(self, x => x.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        blob_apply!(self, x => bytemuck::cast_slice(x.as_slice()))
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        blob_apply!(self, x => bytemuck::cast_slice_mut(x.as_mut_slice()))
    }

    pub fn as_slice<T: BlobElement>(&self) -> Result<&[T], BlobError> {
        T::slice(self).ok_or(BlobError::WrongDTypeError(T::DTYPE, self.dtype()))
    }

    pub fn as_mut_slice<T: BlobElement>(&mut self) -> Result<&mut [T], BlobError> {
        let dtype = self.dtype();
        T::slice_mut(self).ok_or(BlobError::WrongDTypeError(T::DTYPE, dtype))
    }

    pub fn to_vec<T: BlobElement>(&self) -> Result<Vec<T>, BlobError> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// Reads an index stream. Float encodings truncate toward zero.
    pub fn index_values(&self) -> Result<Vec<i64>, BlobError> {
        Ok(match self {
            Blob::I64(x) => x.clone(),
            Blob::I32(x) => x.iter().map(|&v| v as i64).collect(),
            Blob::F32(x) => x.iter().map(|&v| v as i64).collect(),
            Blob::U8(x) => x.iter().map(|&v| v as i64).collect(),
            Blob::I8(x) => x.iter().map(|&v| v as i64).collect(),
            _ => Err(BlobError::NotAnIndexType(self.dtype()))?,
        })
    }
}

/// A tensor's elements together with the layout they are stored in.
/// Clones share the elements; the first write through `blob_mut` on a shared
/// buffer detaches it.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    desc: LayoutDesc,
    blob: Arc<Blob>,
}

impl Memory {
    pub fn new(desc: LayoutDesc, blob: Blob) -> Result<Self, BlobError> {
        Self::from_shared(desc, Arc::new(blob))
    }

    fn from_shared(desc: LayoutDesc, blob: Arc<Blob>) -> Result<Self, BlobError> {
        if blob.dtype() != desc.dtype() {
            return Err(BlobError::WrongDTypeError(desc.dtype(), blob.dtype()));
        }
        let needed = desc.offset_padding() + desc.element_count();
        if blob.len() != needed {
            return Err(BlobError::SizeMismatch(blob.len(), desc.to_string(), needed));
        }
        Ok(Self { desc, blob })
    }

    pub fn zeros(desc: LayoutDesc) -> Self {
        let blob = Blob::zeros(desc.dtype(), desc.offset_padding() + desc.element_count());
        Self {
            desc,
            blob: Arc::new(blob),
        }
    }

    pub fn from_vec_shape<T: BlobElement>(v: Vec<T>, dims: &[usize]) -> Result<Self, BlobError> {
        Self::new(LayoutDesc::plain(T::DTYPE, dims), Blob::from_vec(v))
    }

    pub fn from_ndarray<T: BlobElement>(array: &ArrayD<T>) -> Self {
        let desc = LayoutDesc::plain(T::DTYPE, array.shape());
        Self {
            desc,
            blob: Arc::new(Blob::from_vec(array.iter().copied().collect())),
        }
    }

    /// Logical view of the data, whatever the physical layout.
    pub fn to_ndarray<T: BlobElement>(&self) -> Result<ArrayD<T>, BlobError> {
        let plain = if self.desc.is_plain() && self.desc.has_zero_padding() {
            self.blob.to_vec::<T>()?
        } else {
            let reordered = self.reorder_to(&LayoutDesc::plain(self.desc.dtype(), self.desc.dims()))?;
            reordered.blob.to_vec::<T>()?
        };
        Ok(ArrayD::from_shape_vec(IxDyn(self.desc.dims()), plain)?)
    }

    pub fn desc(&self) -> &LayoutDesc {
        &self.desc
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn blob_mut(&mut self) -> &mut Blob {
        Arc::make_mut(&mut self.blob)
    }

    pub fn into_blob(self) -> Blob {
        Arc::unwrap_or_clone(self.blob)
    }

    /// True when both hold the very same elements, not merely equal ones.
    pub fn shares_blob(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.blob, &other.blob)
    }

    /// Reinterprets the same bytes under another descriptor of equal size.
    /// The elements stay shared with every other clone.
    pub fn with_desc(self, desc: LayoutDesc) -> Result<Self, BlobError> {
        Self::from_shared(desc, self.blob)
    }

    /// Copies every logical element into a fresh buffer laid out as `desc`.
    pub fn reorder_to(&self, desc: &LayoutDesc) -> Result<Memory, BlobError> {
        if !self.desc.same_logical(desc) {
            return Err(LayoutError::IncompatibleLayouts(self.desc.to_string(), desc.to_string()).into());
        }
        let mut out = Memory::zeros(desc.clone());
        let item = self.desc.dtype().size();
        let src = self.blob.as_bytes();
        let dst = out.blob_mut().as_bytes_mut();
        let mut odometer = Odometer::new(self.desc.dims());
        while let Some(coord) = odometer.index() {
            let s = self.desc.physical_offset(coord)? * item;
            let d = desc.physical_offset(coord)? * item;
            dst[d..d + item].copy_from_slice(&src[s..s + item]);
            odometer.advance();
        }
        Ok(out)
    }
}

/// Shared write access to one destination buffer from inside a parallel
/// region. Each worker carves out its own sub-slice.
pub struct SharedSliceMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSliceMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedSliceMut<'_, T> {}

impl<'a, T> SharedSliceMut<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows `[offset, offset + len)`. Panics if the range leaves the buffer.
    ///
    /// # Safety
    /// Ranges borrowed at the same time, from any thread, must not overlap.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [T] {
        let end = offset.checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "range {offset}+{len} exceeds buffer of {}",
            self.len
        );
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }
}
