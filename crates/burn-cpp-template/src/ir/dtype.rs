use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Element type of a tensor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F64,
    F16,
    BF16,
    I64,
    I32,
    I8,
    U8,
}

impl DType {
    /// The C++ spelling of the element type.
    pub fn cpp_type(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
            DType::F16 => "half",
            DType::BF16 => "bfloat16",
            DType::I64 => "int64_t",
            DType::I32 => "int32_t",
            DType::I8 => "int8_t",
            DType::U8 => "uint8_t",
        }
    }

    /// The type products are accumulated in.
    pub fn acc_type(&self) -> DType {
        match self {
            DType::F64 => DType::F64,
            DType::F32 | DType::F16 | DType::BF16 => DType::F32,
            DType::I64 => DType::I64,
            DType::I32 | DType::I8 | DType::U8 => DType::I32,
        }
    }

}
