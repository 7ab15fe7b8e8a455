use crate::{
    gemm::Reindexer,
    ir::{SizeVar, SymExpr},
};
use std::sync::Arc;

/// Prepends the batch index to the `[row, col]` indices of a per-item GEMM, so epilogues index
/// their full `[batch, row, col]` outputs.
#[derive(new, Debug, Clone)]
pub struct BatchReindexer {
    b_index: SizeVar,
}

impl Reindexer for BatchReindexer {
    fn reindex(&self, indices: Vec<SymExpr>) -> Vec<SymExpr> {
        let mut reindexed = Vec::with_capacity(indices.len() + 1);
        reindexed.push(SymExpr::from(&self.b_index));
        reindexed.extend(indices);
        reindexed
    }
}

/// One batch reindexer per epilogue, in epilogue order.
pub fn batch_reindexers(b_index: &SizeVar, num_epilogues: usize) -> Vec<Arc<dyn Reindexer>> {
    (0..num_epilogues)
        .map(|_| Arc::new(BatchReindexer::new(b_index.clone())) as Arc<dyn Reindexer>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_index_is_prepended() {
        let b_index = SizeVar::new("s_b_index");
        let reindexer = BatchReindexer::new(b_index.clone());

        let indices = reindexer.reindex(vec![SymExpr::index("row"), SymExpr::index("col")]);

        assert_eq!(
            indices,
            vec![
                SymExpr::Var(b_index),
                SymExpr::index("row"),
                SymExpr::index("col")
            ]
        );
    }

    #[test]
    fn one_reindexer_per_epilogue() {
        let b_index = SizeVar::new("s_b_index");

        let reindexers = batch_reindexers(&b_index, 3);

        assert_eq!(reindexers.len(), 3);
        for reindexer in reindexers {
            assert_eq!(
                reindexer.reindex(vec![SymExpr::Const(2), SymExpr::Const(5)]),
                vec![SymExpr::Var(b_index.clone()), SymExpr::Const(2), SymExpr::Const(5)]
            );
        }
    }
}
