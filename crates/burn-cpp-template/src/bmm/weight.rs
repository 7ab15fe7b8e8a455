use crate::{
    error::{Result, TemplateError},
    gemm::{GemmTemplate, LayoutType},
    ir::{SymExpr, TensorDesc, TensorOp, TensorRewrite, TensorSource},
};
use serde::Serialize;

/// How the batched weight is prepared before the GEMM reads it.
#[derive(new, Debug, Clone, PartialEq, Serialize)]
pub struct WeightPlan {
    /// Blocked size, the leading `-1` standing for the batch.
    pub new_size: Vec<i64>,
    pub padded_n: usize,
    pub blocked: bool,
    pub rewrite: TensorRewrite,
}

impl WeightPlan {
    /// The weight the GEMM reads.
    pub fn weight(&self) -> &TensorDesc {
        &self.rewrite.output
    }
}

/// Padded and blocked size of a batched weight `[b, k, n]`.
///
/// The matrix part is computed by the GEMM template.
pub fn padded_size<G: GemmTemplate>(
    gemm: &G,
    n: usize,
    block_n: usize,
    k: usize,
    should_block: bool,
) -> (Vec<i64>, usize) {
    if should_block {
        let (mut new_size, padded_n) = gemm.padded_size(n, block_n, k, should_block);
        new_size.insert(0, -1);
        (new_size, padded_n)
    } else {
        (vec![-1, k as i64, n as i64], n)
    }
}

/// Whether the weight has to be blocked before the micro-kernel can read it.
///
/// Constants are always blocked, the constant folding pass materializes them once.
pub fn should_block_weight(w: &TensorDesc, layout: LayoutType) -> bool {
    layout != LayoutType::Normal || !w.is_contiguous() || w.is_constant()
}

/// Pad the columns of the weight and split them into `[b, n_blocks, k, block_n]` panels.
pub fn block_weight(w: &TensorDesc, new_size: &[i64], padding: usize) -> Result<TensorRewrite> {
    if new_size.len() != 4 {
        return Err(TemplateError::malformed(
            &w.name,
            format!("blocked size {new_size:?} must have 4 dimensions"),
        ));
    }

    if w.is_constant() {
        let sizes = new_size
            .iter()
            .enumerate()
            .map(|(dim, size)| match *size {
                -1 => w.size(dim).cloned(),
                size => Ok(SymExpr::Const(size)),
            })
            .collect::<Result<Vec<_>>>()?;
        let output = TensorDesc::contiguous(w.name.clone(), w.dtype, sizes, TensorSource::Constant);

        log::debug!("Constant weight {} is blocked by constant folding", w.name);
        return Ok(TensorRewrite {
            input: w.clone(),
            ops: Vec::new(),
            output,
        });
    }

    let mut permuted_size = new_size.to_vec();
    permuted_size.swap(1, 2);

    let mut rewrite = TensorRewrite::identity(w.clone());
    if padding > 0 {
        rewrite = rewrite.then(TensorOp::PadLast { amount: padding })?;
    }

    rewrite
        .then(TensorOp::View {
            sizes: permuted_size,
        })?
        .then(TensorOp::Permute {
            dims: vec![0, 2, 1, 3],
        })
}

/// Interleave the `k` rows of each panel for the layout and materialize the result.
pub fn pack_weight(
    rewrite: TensorRewrite,
    layout: LayoutType,
    new_size: &[i64],
) -> Result<TensorRewrite> {
    if rewrite.input.is_constant() {
        return Ok(rewrite);
    }

    let mut rewrite = rewrite;

    if layout != LayoutType::Normal {
        let vnni = layout.vnni_size() as i64;
        let rank = new_size.len();
        let k = new_size[rank - 2];

        if k % vnni != 0 {
            return Err(TemplateError::UnsupportedLayout(format!(
                "k={k} is not a multiple of the {layout} interleave factor {vnni}"
            )));
        }

        let mut vnni_view_size = new_size.to_vec();
        vnni_view_size[rank - 2] = k / vnni;
        vnni_view_size.insert(rank - 1, vnni);

        rewrite = rewrite
            .then(TensorOp::View {
                sizes: vnni_view_size,
            })?
            .then(TensorOp::Permute {
                dims: vec![0, 1, 2, 4, 3],
            })?
            .then(TensorOp::View {
                sizes: new_size.to_vec(),
            })?;
    }

    let mut rewrite = rewrite.then(TensorOp::Contiguous)?;
    rewrite.output.name = format!("{}_blocked", rewrite.input.name);

    Ok(rewrite)
}

/// Decide how to prepare a batched weight `[b, k, n]` for the micro-kernel of `gemm`.
pub fn prep_weight<G: GemmTemplate>(w: &TensorDesc, gemm: &G) -> Result<WeightPlan> {
    let micro = gemm.micro_gemm();
    micro.register_blocking.validate()?;

    if w.rank() != 3 {
        return Err(TemplateError::malformed(
            &w.name,
            format!("expected a batched weight [b, k, n], got rank {}", w.rank()),
        ));
    }

    let k = w.static_size(1)?;
    let n = w.static_size(2)?;
    let block_n = micro.register_blocking.block_n;
    let blocked = should_block_weight(w, micro.layout);
    let (new_size, padded_n) = padded_size(gemm, n, block_n, k, blocked);
    if padded_n < n {
        return Err(TemplateError::malformed(
            &w.name,
            format!("padded n={padded_n} is smaller than n={n}"),
        ));
    }

    let rewrite = if blocked {
        let rewrite = block_weight(w, &new_size, padded_n - n)?;
        pack_weight(rewrite, micro.layout, &new_size)?
    } else {
        TensorRewrite::identity(w.clone())
    };

    log::debug!(
        "Weight {} prepared as {} with {} ops, new size {new_size:?}",
        w.name,
        rewrite.output.name,
        rewrite.ops.len()
    );

    Ok(WeightPlan::new(new_size, padded_n, blocked, rewrite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemm::{
        CppGemmTemplate, GemmBlocking, GemmInputs, MicroGemm, Reindexer, RenderOptions,
    };
    use crate::ir::{DType, SizeVar};
    use crate::kernel::CppTemplateKernel;
    use std::sync::Arc;
    use ndarray::{ArrayD, IxDyn};
    use rstest::rstest;

    fn weight(dims: &[usize], source: TensorSource) -> TensorDesc {
        TensorDesc::contiguous(
            "arg1_1",
            DType::F32,
            dims.iter().map(|dim| SymExpr::from(*dim)).collect(),
            source,
        )
    }

    fn gemm(block_n: usize, layout: LayoutType) -> CppGemmTemplate {
        let micro = MicroGemm::new(
            "micro_gemm".to_string(),
            DType::F32,
            DType::F32,
            DType::F32,
            GemmBlocking::new(4, block_n, 1),
            layout,
        );
        CppGemmTemplate::new(micro, 1, 1.0, 1.0)
    }

    /// Pads `n` to a multiple of two panels.
    struct WidePanels(CppGemmTemplate);

    impl GemmTemplate for WidePanels {
        fn micro_gemm(&self) -> &MicroGemm {
            self.0.micro_gemm()
        }

        fn num_threads(&self) -> usize {
            self.0.num_threads()
        }

        fn padded_size(
            &self,
            n: usize,
            block_n: usize,
            k: usize,
            _should_block: bool,
        ) -> (Vec<i64>, usize) {
            let padded_n = n.div_ceil(2 * block_n) * 2 * block_n;
            (vec![(padded_n / block_n) as i64, k as i64, block_n as i64], padded_n)
        }

        fn options(
            &self,
            inputs: &GemmInputs,
            reindexers: Vec<Arc<dyn Reindexer>>,
        ) -> Result<RenderOptions> {
            self.0.options(inputs, reindexers)
        }

        fn render_gemm(
            &self,
            kernel: &mut CppTemplateKernel,
            options: &RenderOptions,
            signature: &str,
        ) -> Result<String> {
            self.0.render_gemm(kernel, options, signature)
        }
    }

    #[test]
    fn padded_size_prepends_batch() {
        let gemm = gemm(16, LayoutType::Normal);

        assert_eq!(padded_size(&gemm, 30, 16, 8, true), (vec![-1, 2, 8, 16], 32));
        assert_eq!(padded_size(&gemm, 30, 16, 8, false), (vec![-1, 8, 30], 30));
    }

    #[rstest]
    #[case(LayoutType::Normal, TensorSource::Computed, false)]
    #[case(LayoutType::Vnni2, TensorSource::Computed, true)]
    #[case(LayoutType::Normal, TensorSource::Constant, true)]
    fn block_decision(
        #[case] layout: LayoutType,
        #[case] source: TensorSource,
        #[case] expected: bool,
    ) {
        let w = weight(&[2, 8, 30], source);
        assert_eq!(should_block_weight(&w, layout), expected);
    }

    #[test]
    fn transposed_weight_is_blocked() {
        let mut w = weight(&[2, 8, 30], TensorSource::Computed);
        w.strides = vec![SymExpr::Const(240), SymExpr::Const(1), SymExpr::Const(8)];
        assert!(should_block_weight(&w, LayoutType::Normal));
    }

    #[test]
    fn contiguous_weight_is_never_reshaped() {
        let w = weight(&[2, 8, 30], TensorSource::Computed);

        let plan = prep_weight(&w, &gemm(16, LayoutType::Normal)).unwrap();

        assert!(!plan.blocked);
        assert!(plan.rewrite.is_identity());
        assert_eq!(plan.weight(), &w);
        assert_eq!(plan.padded_n, 30);
    }

    #[test]
    fn blocked_weight_ops() {
        let plan = prep_weight(
            &weight(&[2, 8, 30], TensorSource::Computed),
            &gemm(16, LayoutType::Vnni2),
        )
        .unwrap();

        assert_eq!(
            plan.rewrite.ops,
            vec![
                TensorOp::PadLast { amount: 2 },
                TensorOp::View {
                    sizes: vec![-1, 8, 2, 16]
                },
                TensorOp::Permute {
                    dims: vec![0, 2, 1, 3]
                },
                TensorOp::View {
                    sizes: vec![-1, 2, 4, 2, 16]
                },
                TensorOp::Permute {
                    dims: vec![0, 1, 2, 4, 3]
                },
                TensorOp::View {
                    sizes: vec![-1, 2, 8, 16]
                },
                TensorOp::Contiguous,
            ]
        );
        assert_eq!(plan.weight().name, "arg1_1_blocked");
        assert!(plan.weight().is_contiguous());
    }

    #[test]
    fn divisible_weight_is_not_padded() {
        let plan = prep_weight(
            &weight(&[2, 8, 32], TensorSource::Computed),
            &gemm(16, LayoutType::Vnni4),
        )
        .unwrap();

        assert!(!plan
            .rewrite
            .ops
            .iter()
            .any(|op| matches!(op, TensorOp::PadLast { .. })));
        assert_eq!(plan.padded_n, 32);
    }

    #[test]
    fn constant_weight_keeps_its_name_and_gets_no_ops() {
        let batch = SizeVar::new("s0");
        let w = TensorDesc::contiguous(
            "_frozen_param0",
            DType::F32,
            vec![SymExpr::from(&batch), SymExpr::Const(8), SymExpr::Const(30)],
            TensorSource::Constant,
        );

        let plan = prep_weight(&w, &gemm(16, LayoutType::Vnni2)).unwrap();

        assert!(plan.blocked);
        assert!(plan.rewrite.ops.is_empty());
        assert_eq!(plan.weight().name, "_frozen_param0");
        assert_eq!(
            plan.weight().sizes,
            vec![
                SymExpr::Var(batch),
                SymExpr::Const(2),
                SymExpr::Const(8),
                SymExpr::Const(16)
            ]
        );
    }

    #[test]
    fn interleave_must_divide_k() {
        let err = prep_weight(
            &weight(&[2, 6, 32], TensorSource::Computed),
            &gemm(16, LayoutType::Vnni4),
        )
        .unwrap_err();

        assert!(matches!(err, TemplateError::UnsupportedLayout(_)));
    }

    #[test]
    fn unbatched_weight_is_malformed() {
        let err = prep_weight(
            &weight(&[8, 32], TensorSource::Computed),
            &gemm(16, LayoutType::Normal),
        )
        .unwrap_err();

        assert!(matches!(err, TemplateError::MalformedShape { .. }));
    }

    #[test]
    fn blocking_follows_gemm_template() {
        let plan = prep_weight(
            &weight(&[2, 8, 30], TensorSource::Computed),
            &WidePanels(gemm(16, LayoutType::Vnni2)),
        )
        .unwrap();

        assert_eq!(plan.padded_n, 32);
        assert_eq!(plan.new_size, vec![-1, 2, 8, 16]);

        let plan = prep_weight(
            &weight(&[2, 8, 40], TensorSource::Computed),
            &WidePanels(gemm(16, LayoutType::Vnni2)),
        )
        .unwrap();

        assert_eq!(plan.padded_n, 64);
        assert_eq!(plan.new_size, vec![-1, 4, 8, 16]);
        assert_eq!(plan.rewrite.ops[0], TensorOp::PadLast { amount: 24 });
        assert_eq!(plan.weight().sizes[1], SymExpr::Const(4));
    }

    #[rstest]
    #[case(GemmBlocking::new(4, 0, 1))]
    #[case(GemmBlocking::new(0, 16, 1))]
    fn empty_blocks_are_rejected(#[case] blocking: GemmBlocking) {
        let micro = MicroGemm::new(
            "micro_gemm".to_string(),
            DType::F32,
            DType::F32,
            DType::F32,
            blocking,
            LayoutType::Normal,
        );
        let gemm = CppGemmTemplate::new(micro, 1, 1.0, 1.0);

        let err = prep_weight(&weight(&[2, 8, 30], TensorSource::Computed), &gemm).unwrap_err();

        assert!(matches!(err, TemplateError::InvalidBlocking(_)));
    }

    #[rstest]
    #[case(LayoutType::Normal, 30, 16)]
    #[case(LayoutType::Vnni2, 30, 16)]
    #[case(LayoutType::Vnni4, 17, 8)]
    fn packed_weight_holds_original_values(
        #[case] layout: LayoutType,
        #[case] n: usize,
        #[case] block_n: usize,
    ) {
        let (b, k) = (3, 8);
        let mut w = weight(&[b, k, n], TensorSource::Computed);
        // Force blocking for the normal layout with a transposed weight.
        w.strides = vec![
            SymExpr::from(k * n),
            SymExpr::Const(1),
            SymExpr::from(k),
        ];
        let values = ArrayD::from_shape_fn(IxDyn(&[b, k, n]), |index| {
            (index[0] * 1000 + index[1] * 100 + index[2]) as f32
        });

        let plan = prep_weight(&w, &gemm(block_n, layout)).unwrap();
        let packed = plan.rewrite.apply(values.clone()).unwrap();

        let vnni = layout.vnni_size();
        let n_blocks = plan.padded_n / block_n;
        assert_eq!(plan.padded_n % block_n, 0);
        assert!(plan.padded_n >= n && plan.padded_n - n < block_n);
        assert_eq!(packed.shape(), &[b, n_blocks, k, block_n]);

        let memory = packed
            .into_shape_with_order(IxDyn(&[b, n_blocks, k / vnni, block_n, vnni]))
            .unwrap();
        for bi in 0..b {
            for ki in 0..k {
                for ni in 0..plan.padded_n {
                    let stored = memory[[bi, ni / block_n, ki / vnni, ni % block_n, ki % vnni]];
                    let expected = if ni < n { values[[bi, ki, ni]] } else { 0.0 };
                    assert_eq!(stored, expected);
                }
            }
        }
    }
}
