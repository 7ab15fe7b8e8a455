use crate::ir::{SymExpr, TensorDesc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Elementwise operation fused after the GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "lowercase")]
pub enum EpilogueOp {
    Relu,
    Sigmoid,
    Scale(f32),
}

impl EpilogueOp {
    /// C++ expression applying the operation to `value` of type `ty`.
    pub fn render(&self, value: &str, ty: &str) -> String {
        match self {
            EpilogueOp::Relu => format!("std::max({value}, static_cast<{ty}>(0))"),
            EpilogueOp::Sigmoid => {
                format!("static_cast<{ty}>(1) / (static_cast<{ty}>(1) + std::exp(-{value}))")
            }
            EpilogueOp::Scale(factor) => format!("{value} * static_cast<{ty}>({factor:?})"),
        }
    }
}

/// An epilogue and the tensor it writes.
///
/// Epilogues are chained: each one takes the value produced by the previous one.
#[derive(new, Debug, Clone, PartialEq, Serialize)]
pub struct Epilogue {
    pub op: EpilogueOp,
    pub output: TensorDesc,
}

/// Maps the indices of the GEMM output to the indices of an epilogue output.
pub trait Reindexer: core::fmt::Debug {
    fn reindex(&self, indices: Vec<SymExpr>) -> Vec<SymExpr>;
}

/// Reindexer for epilogue outputs shaped like the GEMM output.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityReindexer;

impl Reindexer for IdentityReindexer {
    fn reindex(&self, indices: Vec<SymExpr>) -> Vec<SymExpr> {
        indices
    }
}

/// One identity reindexer per epilogue.
pub fn default_reindexers(num_epilogues: usize) -> Vec<Arc<dyn Reindexer>> {
    (0..num_epilogues)
        .map(|_| Arc::new(IdentityReindexer) as Arc<dyn Reindexer>)
        .collect()
}
