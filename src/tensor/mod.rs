//! Dynamically typed tensors
//!
//! A [`Tensor`] is a named [`TiledArray`] whose element type is only known at
//! runtime. Operators match on [`TypedArray`] (usually through
//! [`with_array!`](crate::with_array)) to get back to the statically typed array.

use crate::error::{ForgeResult, GraphForgeError};
use crate::memory::{AllocationContext, DataType, Element, TiledArray, UsageMarker};
use std::fmt;
use std::ops::Range;

/// A tiled array of any supported element type
#[derive(Debug, Clone)]
pub enum TypedArray {
    Int8(TiledArray<i8>),
    UInt8(TiledArray<u8>),
    Int16(TiledArray<i16>),
    UInt16(TiledArray<u16>),
    Int32(TiledArray<i32>),
    UInt32(TiledArray<u32>),
    Int64(TiledArray<i64>),
    UInt64(TiledArray<u64>),
    Float32(TiledArray<f32>),
    Float64(TiledArray<f64>),
    Bool(TiledArray<bool>),
}

/// Run `$body` with `$a` bound to the typed array inside a [`TypedArray`]
#[macro_export]
macro_rules! with_array {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            $crate::tensor::TypedArray::Int8($a) => $body,
            $crate::tensor::TypedArray::UInt8($a) => $body,
            $crate::tensor::TypedArray::Int16($a) => $body,
            $crate::tensor::TypedArray::UInt16($a) => $body,
            $crate::tensor::TypedArray::Int32($a) => $body,
            $crate::tensor::TypedArray::UInt32($a) => $body,
            $crate::tensor::TypedArray::Int64($a) => $body,
            $crate::tensor::TypedArray::UInt64($a) => $body,
            $crate::tensor::TypedArray::Float32($a) => $body,
            $crate::tensor::TypedArray::Float64($a) => $body,
            $crate::tensor::TypedArray::Bool($a) => $body,
        }
    };
}

/// Like [`with_array!`] but rewraps the result in the same variant
#[macro_export]
macro_rules! map_array {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            $crate::tensor::TypedArray::Int8($a) => $crate::tensor::TypedArray::Int8($body),
            $crate::tensor::TypedArray::UInt8($a) => $crate::tensor::TypedArray::UInt8($body),
            $crate::tensor::TypedArray::Int16($a) => $crate::tensor::TypedArray::Int16($body),
            $crate::tensor::TypedArray::UInt16($a) => $crate::tensor::TypedArray::UInt16($body),
            $crate::tensor::TypedArray::Int32($a) => $crate::tensor::TypedArray::Int32($body),
            $crate::tensor::TypedArray::UInt32($a) => $crate::tensor::TypedArray::UInt32($body),
            $crate::tensor::TypedArray::Int64($a) => $crate::tensor::TypedArray::Int64($body),
            $crate::tensor::TypedArray::UInt64($a) => $crate::tensor::TypedArray::UInt64($body),
            $crate::tensor::TypedArray::Float32($a) => $crate::tensor::TypedArray::Float32($body),
            $crate::tensor::TypedArray::Float64($a) => $crate::tensor::TypedArray::Float64($body),
            $crate::tensor::TypedArray::Bool($a) => $crate::tensor::TypedArray::Bool($body),
        }
    };
}

/// Run `$body` with the type alias `$t` bound to the Rust type of a [`DataType`]
#[macro_export]
macro_rules! with_data_type {
    ($data_type:expr, $t:ident => $body:expr) => {
        match $data_type {
            $crate::memory::DataType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::memory::DataType::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::memory::DataType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::memory::DataType::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::memory::DataType::Int32 => {
                type $t = i32;
                $body
            }
            $crate::memory::DataType::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::memory::DataType::Int64 => {
                type $t = i64;
                $body
            }
            $crate::memory::DataType::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::memory::DataType::Float32 => {
                type $t = f32;
                $body
            }
            $crate::memory::DataType::Float64 => {
                type $t = f64;
                $body
            }
            $crate::memory::DataType::Bool => {
                type $t = bool;
                $body
            }
        }
    };
}

/// Element types that know their [`TypedArray`] variant
pub trait TensorElement: Element {
    fn wrap(array: TiledArray<Self>) -> TypedArray;
    fn unwrap_ref(array: &TypedArray) -> Option<&TiledArray<Self>>;
}

macro_rules! impl_tensor_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl TensorElement for $ty {
                fn wrap(array: TiledArray<Self>) -> TypedArray {
                    TypedArray::$variant(array)
                }

                fn unwrap_ref(array: &TypedArray) -> Option<&TiledArray<Self>> {
                    match array {
                        TypedArray::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<TiledArray<$ty>> for TypedArray {
                fn from(array: TiledArray<$ty>) -> Self {
                    TypedArray::$variant(array)
                }
            }
        )*
    };
}

impl_tensor_element! {
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
    bool => Bool,
}

impl TypedArray {
    pub fn data_type(&self) -> DataType {
        with_array!(self, a => a.data_type())
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }
}

/// Named, dynamically typed tensor value
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    array: TypedArray,
}

impl Tensor {
    pub fn new(name: impl Into<String>, array: impl Into<TypedArray>) -> Self {
        Tensor {
            name: name.into(),
            array: array.into(),
        }
    }

    pub fn from_array<T: TensorElement>(name: impl Into<String>, array: TiledArray<T>) -> Self {
        Tensor {
            name: name.into(),
            array: T::wrap(array),
        }
    }

    /// Detached tensor holding `data` in row-major order
    pub fn from_vec<T: TensorElement>(
        name: impl Into<String>,
        shape: &[usize],
        data: Vec<T>,
    ) -> ForgeResult<Self> {
        Ok(Self::from_array(name, TiledArray::from_vec(shape, data)?))
    }

    /// Detached tensor from lossy `f64` values, as read from JSON
    pub fn from_f64_values(
        name: impl Into<String>,
        data_type: DataType,
        shape: &[usize],
        values: &[f64],
    ) -> ForgeResult<Self> {
        let name = name.into();
        with_data_type!(data_type, T => {
            let data: Vec<T> = values.iter().map(|v| <T as Element>::from_f64(*v)).collect();
            Self::from_vec::<T>(name, shape, data)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn array(&self) -> &TypedArray {
        &self.array
    }

    pub fn into_array(self) -> TypedArray {
        self.array
    }

    /// The statically typed array, or `TypeMismatch`
    pub fn typed<T: TensorElement>(&self) -> ForgeResult<&TiledArray<T>> {
        T::unwrap_ref(&self.array).ok_or_else(|| {
            GraphForgeError::TypeMismatch(format!(
                "tensor '{}' is {}, expected {}",
                self.name,
                self.data_type(),
                T::DATA_TYPE
            ))
        })
    }

    pub fn data_type(&self) -> DataType {
        self.array.data_type()
    }

    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn linear_size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn blocks_num(&self) -> usize {
        with_array!(&self.array, a => a.blocks_num())
    }

    pub fn block_ids(&self) -> Vec<u64> {
        with_array!(&self.array, a => a.block_ids())
    }

    pub fn shares_blocks_with(&self, other: &Tensor) -> bool {
        let ours = self.block_ids();
        other.block_ids().iter().any(|id| ours.contains(id))
    }

    pub fn view(&self, index: &[usize]) -> ForgeResult<Tensor> {
        Ok(Tensor {
            name: self.name.clone(),
            array: map_array!(&self.array, a => a.view(index)?),
        })
    }

    pub fn view_rows(&self, rows: Range<usize>) -> ForgeResult<Tensor> {
        Ok(Tensor {
            name: self.name.clone(),
            array: map_array!(&self.array, a => a.view_rows(rows.clone())?),
        })
    }

    pub fn reshape(&self, shape: &[usize]) -> ForgeResult<Tensor> {
        Ok(Tensor {
            name: self.name.clone(),
            array: map_array!(&self.array, a => a.reshape(shape)?),
        })
    }

    pub fn mark_used(&self) {
        with_array!(&self.array, a => a.mark_used())
    }

    pub fn mark_output(&self) {
        with_array!(&self.array, a => a.mark_output())
    }

    pub fn mark_global_output(&self) {
        with_array!(&self.array, a => a.mark_global_output())
    }

    pub fn markers(&self) -> Vec<UsageMarker> {
        with_array!(&self.array, a => a.markers())
    }

    pub fn is_reclaimable(&self) -> bool {
        with_array!(&self.array, a => a.is_reclaimable())
    }

    /// Copy the contents into a fresh array drawn from `ctx`
    pub fn copy_into(&self, ctx: &AllocationContext) -> ForgeResult<Tensor> {
        let array = map_array!(&self.array, a => {
            let copy = ctx.get_array_like(a, false)?;
            copy.copy_from_slice(&a.to_vec()?)?;
            copy
        });
        Ok(Tensor {
            name: self.name.clone(),
            array,
        })
    }

    /// Contents widened to `f64`, row-major
    pub fn to_f64_vec(&self) -> ForgeResult<Vec<f64>> {
        with_array!(&self.array, a => Ok(a.to_vec()?.into_iter().map(Element::to_f64).collect()))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{:?}", self.name, self.data_type(), self.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access_checks_element_type() {
        let t = Tensor::from_vec("x", &[2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.data_type(), DataType::Float32);
        assert!(t.typed::<f32>().is_ok());
        assert!(matches!(
            t.typed::<i32>().unwrap_err(),
            GraphForgeError::TypeMismatch(_)
        ));
    }

    #[test]
    fn test_from_f64_values_for_every_type() {
        for data_type in DataType::ALL {
            let t = Tensor::from_f64_values("v", data_type, &[3], &[0.0, 1.0, 2.0]).unwrap();
            assert_eq!(t.data_type(), data_type);
            assert_eq!(t.shape(), &[3]);
        }
        let ints = Tensor::from_f64_values("i", DataType::Int32, &[2], &[1.0, -3.0]).unwrap();
        assert_eq!(ints.to_f64_vec().unwrap(), vec![1.0, -3.0]);
    }

    #[test]
    fn test_view_keeps_name_and_shares_blocks() {
        let t = Tensor::from_vec("kv", &[2, 4], (0..8).collect::<Vec<i64>>()).unwrap();
        let row = t.view(&[1]).unwrap();
        assert_eq!(row.name(), "kv");
        assert_eq!(row.shape(), &[4]);
        assert!(row.shares_blocks_with(&t));
        assert_eq!(row.to_f64_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_marking_through_tensor() {
        let t = Tensor::from_vec("out", &[4], vec![true, false, true, true]).unwrap();
        assert!(t.is_reclaimable());
        t.mark_output();
        assert!(!t.is_reclaimable());
        assert_eq!(t.markers(), vec![UsageMarker::ContextOutput]);
    }

    #[test]
    fn test_copy_into_owns_its_blocks() {
        let storage = crate::memory::ModelArrayStorage::new("copy", true);
        let ctx = storage.create_context().unwrap();
        let source = Tensor::from_vec("w", &[2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();

        let copy = source.copy_into(&ctx).unwrap();
        assert_eq!(copy.name(), "w");
        assert_eq!(copy.shape(), &[2, 3]);
        assert!(!copy.shares_blocks_with(&source));
        copy.typed::<i32>().unwrap().fill(0).unwrap();
        assert_eq!(source.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ctx.produced_blocks(), 2);
    }

    #[test]
    fn test_display() {
        let t = Tensor::from_vec("y", &[1, 2], vec![0u8, 1]).unwrap();
        assert_eq!(t.to_string(), "y: uint8[1, 2]");
    }
}
