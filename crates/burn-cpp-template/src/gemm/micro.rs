use crate::{
    error::{Result, TemplateError},
    ir::DType,
    kernel::render_source,
};
use minijinja::context;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Memory layout the micro-kernel expects for its weight panels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LayoutType {
    /// Row-major panels.
    #[default]
    Normal,
    /// Pairs of consecutive `k` rows interleaved.
    Vnni2,
    /// Groups of four consecutive `k` rows interleaved.
    Vnni4,
}

impl LayoutType {
    /// Layout for an interleave factor.
    pub fn from_interleave(factor: usize) -> Result<Self> {
        match factor {
            1 => Ok(LayoutType::Normal),
            2 => Ok(LayoutType::Vnni2),
            4 => Ok(LayoutType::Vnni4),
            _ => Err(TemplateError::UnsupportedLayout(format!(
                "no packing rule for an interleave factor of {factor}"
            ))),
        }
    }

    /// Number of interleaved `k` rows.
    pub fn vnni_size(&self) -> usize {
        match self {
            LayoutType::Normal => 1,
            LayoutType::Vnni2 => 2,
            LayoutType::Vnni4 => 4,
        }
    }
}

/// Block sizes of the micro-kernel.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmBlocking {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
}

impl GemmBlocking {
    /// Checks every block holds at least one row and one column.
    pub fn validate(&self) -> Result<()> {
        if self.block_m == 0 || self.block_n == 0 {
            return Err(TemplateError::InvalidBlocking(*self));
        }

        Ok(())
    }
}

impl Default for GemmBlocking {
    fn default() -> Self {
        Self::new(4, 16, 1)
    }
}

const MICRO_GEMM_TEMPLATE: &str = r#"inline void {{ name }}(
    const {{ input_t }}* __restrict__ A,
    const {{ input_t }}* __restrict__ B,
    {{ acc_t }}* __restrict__ C,
    int64_t M,
    int64_t N,
    int64_t K,
    int64_t lda,
    int64_t ldb,
    int64_t ldc
) {
    for (int64_t m = 0; m < M; ++m) {
        for (int64_t n = 0; n < N; ++n) {
            {{ acc_t }} sum = 0;
            for (int64_t k = 0; k < K; ++k) {
                sum += static_cast<{{ acc_t }}>(A[m * lda + k]) * static_cast<{{ acc_t }}>(B[{{ b_index }}]);
            }
            C[m * ldc + n] = sum;
        }
    }
}
"#;

/// The micro-kernel chosen for a GEMM: its block sizes and the weight layout it reads.
#[derive(new, Debug, Clone, PartialEq, Serialize)]
pub struct MicroGemm {
    pub name: String,
    pub input_dtype: DType,
    pub output_dtype: DType,
    pub compute_dtype: DType,
    pub register_blocking: GemmBlocking,
    pub layout: LayoutType,
}

impl MicroGemm {
    /// Definition of the micro-kernel function.
    ///
    /// The kernel overwrites `C` with `A * B` for an `M x N` tile, `ldb` being the stride between
    /// consecutive `k` rows before interleaving.
    pub fn codegen_define(&self) -> Result<String> {
        let b_index = match self.layout {
            LayoutType::Normal => "k * ldb + n".to_string(),
            layout => {
                let v = layout.vnni_size();
                format!("(k / {v}) * ldb * {v} + n * {v} + k % {v}")
            }
        };

        render_source(
            "micro_gemm",
            MICRO_GEMM_TEMPLATE,
            context!(
                name => self.name,
                input_t => self.input_dtype.cpp_type(),
                acc_t => self.compute_dtype.cpp_type(),
                b_index => b_index,
            ),
        )
    }
}
