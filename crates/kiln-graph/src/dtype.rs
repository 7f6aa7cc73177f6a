//! Element data types.

/// Element type of a tensor.
///
/// The numbering mirrors the ONNX `TensorProto.DataType` enum so loaders
/// can convert without a lookup table. Only a subset is accepted by the
/// code generator; the rest exist so unsupported models are rejected with
/// a precise diagnostic instead of a decode failure.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DType {
    /// IEEE-754 single-precision float.
    Float,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Boolean.
    Bool,
    /// IEEE-754 half-precision float.
    Float16,
    /// IEEE-754 double-precision float.
    Double,
}

impl DType {
    /// Converts an ONNX `TensorProto.DataType` code, if recognized.
    pub fn from_onnx(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Float),
            6 => Some(Self::Int32),
            7 => Some(Self::Int64),
            9 => Some(Self::Bool),
            10 => Some(Self::Float16),
            11 => Some(Self::Double),
            12 => Some(Self::Uint32),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn byte_width(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::Float16 => 2,
            Self::Float | Self::Uint32 | Self::Int32 => 4,
            Self::Int64 | Self::Double => 8,
        }
    }

    /// Short lowercase name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float => "f32",
            Self::Uint32 => "u32",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Bool => "bool",
            Self::Float16 => "f16",
            Self::Double => "f64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
