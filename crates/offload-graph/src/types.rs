//! Element types and shapes of graph values.

use std::fmt;

/// Tensor element type, numbered after ONNX `TensorProto.DataType`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(i32)]
pub enum DataType {
    Undefined = 0,
    Float = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Bool = 9,
    Float16 = 10,
    Double = 11,
    Uint32 = 12,
    Uint64 = 13,
    Bfloat16 = 16,
}

impl DataType {
    /// Every defined element type, in ascending code order.
    pub const ALL: [DataType; 15] = [
        Self::Undefined,
        Self::Float,
        Self::Uint8,
        Self::Int8,
        Self::Uint16,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::String,
        Self::Bool,
        Self::Float16,
        Self::Double,
        Self::Uint32,
        Self::Uint64,
        Self::Bfloat16,
    ];

    /// Maps an ONNX type code; unknown codes (complex, float8, ...) yield `None`.
    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as i32 == code)
    }

    /// Width of one element in bytes, or `None` for variable-width types.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool => Some(1),
            Self::Uint16 | Self::Int16 | Self::Float16 | Self::Bfloat16 => Some(2),
            Self::Float | Self::Int32 | Self::Uint32 => Some(4),
            Self::Int64 | Self::Double | Self::Uint64 => Some(8),
            Self::Undefined | Self::String => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Float => "float32",
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Float16 => "float16",
            Self::Double => "float64",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Bfloat16 => "bfloat16",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One dimension of a declared shape.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Dim {
    /// Known extent.
    Fixed(i64),
    /// Named extent bound at run time (ONNX `dim_param`).
    Symbolic(String),
    /// Extent not recorded at all.
    Unknown,
}

impl Dim {
    pub fn fixed(&self) -> Option<i64> {
        match self {
            Self::Fixed(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => write!(f, "{d}"),
            Self::Symbolic(name) => f.write_str(name),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// Declared tensor type of a value. Either part may be missing.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct TensorType {
    pub elem_type: Option<DataType>,
    pub shape: Option<Vec<Dim>>,
}

impl TensorType {
    /// Fully static tensor type.
    pub fn new(elem_type: DataType, dims: &[i64]) -> Self {
        Self {
            elem_type: Some(elem_type),
            shape: Some(dims.iter().map(|&d| Dim::Fixed(d)).collect()),
        }
    }

    /// Element type known, shape unknown.
    pub fn unranked(elem_type: DataType) -> Self {
        Self {
            elem_type: Some(elem_type),
            shape: None,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(Vec::len)
    }

    /// The shape as plain integers, if every dimension is fixed.
    pub fn static_shape(&self) -> Option<Vec<i64>> {
        self.shape.as_ref()?.iter().map(Dim::fixed).collect()
    }
}

/// Number of elements described by `dims` (1 for a scalar).
///
/// Returns `None` when a dimension is negative or the product overflows.
pub fn element_count(dims: &[i64]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        let d = usize::try_from(d).ok()?;
        acc.checked_mul(d)
    })
}
