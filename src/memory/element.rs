//! Primitive element types that can live in pooled blocks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Runtime tag for the element type of a block or tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Bool,
}

impl DataType {
    pub const ALL: [DataType; 11] = [
        DataType::Int8,
        DataType::UInt8,
        DataType::Int16,
        DataType::UInt16,
        DataType::Int32,
        DataType::UInt32,
        DataType::Int64,
        DataType::UInt64,
        DataType::Float32,
        DataType::Float64,
        DataType::Bool,
    ];

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Bool)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Bool => "bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A primitive type that can be stored in a block
///
/// The zero value used for `fill_zeros` is `Default::default()`.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Lossy conversion used by JSON initializers and the CLI
    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;
}

/// Element types that support arithmetic
pub trait NumericElement:
    Element + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + PartialOrd
{
}

macro_rules! impl_numeric_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dt;

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }

            impl NumericElement for $ty {}
        )*
    };
}

impl_numeric_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Bool;

    fn from_f64(value: f64) -> Self {
        value != 0.0
    }

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}
