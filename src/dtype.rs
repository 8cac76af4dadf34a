use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DTypeError {
    #[error("The node does not support the dtype {0}")]
    DTypeNotSupportedByNode(DType),
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    BF16,
    F16,
    I64,
    I32,
    U8,
    I8,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 => 4,
            DType::BF16 => 2,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
            DType::I8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::BF16 | DType::F16)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F64 => write!(f, "Float64"),
            DType::F32 => write!(f, "Float32"),
            DType::BF16 => write!(f, "BFloat16"),
            DType::F16 => write!(f, "Float16"),
            DType::I64 => write!(f, "Int64"),
            DType::I32 => write!(f, "Int32"),
            DType::U8 => write!(f, "UInt8"),
            DType::I8 => write!(f, "Int8"),
        }
    }
}

pub trait DTypeOfPrimitive {
    const DTYPE: DType;
}

impl DTypeOfPrimitive for f64 { const DTYPE: DType = DType::F64; }
impl DTypeOfPrimitive for f32 { const DTYPE: DType = DType::F32; }
impl DTypeOfPrimitive for bf16 { const DTYPE: DType = DType::BF16; }
impl DTypeOfPrimitive for f16 { const DTYPE: DType = DType::F16; }
impl DTypeOfPrimitive for i64 { const DTYPE: DType = DType::I64; }
impl DTypeOfPrimitive for i32 { const DTYPE: DType = DType::I32; }
impl DTypeOfPrimitive for u8 { const DTYPE: DType = DType::U8; }
impl DTypeOfPrimitive for i8 { const DTYPE: DType = DType::I8; }
