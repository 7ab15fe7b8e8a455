use super::{batch_reindexers, gemm_function_call, prep_weight, render_wrapper, WeightPlan};
use crate::{
    error::{Result, TemplateError},
    gemm::{gemm_kernel_def, GemmInputs, GemmTemplate, RenderOptions},
    ir::{SizeVar, SymExpr, TensorDesc},
    kernel::{CppTemplateKernel, PartialRender},
};
use serde::Serialize;

/// Operands of a batched GEMM: `X [b, m, k]`, `W [b, k, n]` and `Y [b, m, n]`.
pub type BmmInputs = GemmInputs;

/// A generated BMM kernel and the preparation its weight needs.
#[derive(new, Debug, Clone, Serialize)]
pub struct BmmKernel {
    pub source: String,
    pub weight: WeightPlan,
}

/// Batched GEMM built from two versions of a single-item GEMM.
///
/// The per-item GEMM is rendered twice from the same template: `threaded_mm` with the configured
/// number of threads and `single_thread_mm` with one thread. The exported function runs
/// `single_thread_mm` on as many items as can keep every thread busy, then `threaded_mm` on the
/// remainder.
#[derive(new, Debug, Clone)]
pub struct CppBmmTemplate<G> {
    gemm: G,
}

impl<G: GemmTemplate> CppBmmTemplate<G> {
    /// Decide how the batched weight is prepared for the micro-kernel.
    pub fn prep_weight(&self, w: &TensorDesc) -> Result<WeightPlan> {
        prep_weight(w, &self.gemm)
    }

    /// Render options of the per-item GEMM, the operands selected at `b_index`.
    pub fn options(&self, b_index: &SizeVar, inputs: &BmmInputs) -> Result<RenderOptions> {
        check_rank(&inputs.x, &[3])?;
        check_rank(&inputs.w, &[3, 4])?;
        check_rank(&inputs.y, &[3])?;
        if let Some(bias) = &inputs.bias {
            check_rank(bias, &[1])?;
        }
        for epilogue in inputs.epilogues.iter() {
            check_rank(&epilogue.output, &[3])?;
        }
        check_extents(inputs)?;

        if self.gemm.num_threads() == 0 {
            return Err(TemplateError::InvalidThreads(0));
        }

        let reindexers = batch_reindexers(b_index, inputs.epilogues.len());
        let mut options = self.gemm.options(inputs, reindexers)?;

        options.bx = Some(options.x.clone());
        options.bw = Some(options.w.clone());
        options.by = Some(options.y.clone());
        options.by_2d = Some(options.y_2d.clone());

        let index = SymExpr::from(b_index);
        options.x = options.x.select(0, index.clone())?;
        options.w = options.w.select(0, index.clone())?;
        options.y = options.y.select(0, index.clone())?;
        options.gemm_out = options.gemm_out.select(0, index.clone())?;
        options.y_2d = options.y_2d.select(0, index)?;

        check_rank(&options.x, &[2])?;
        check_rank(&options.y, &[2])?;

        options.x_dtype = options.x.dtype.cpp_type();
        options.w_dtype = options.w.dtype.cpp_type();
        options.y_dtype = options.y.dtype.cpp_type();
        options.b_index = Some(b_index.clone());

        Ok(options)
    }

    /// Render the micro-kernel, both per-item GEMMs and the exported batch loop.
    ///
    /// The per-item signatures and the calls are resolved here. The signature of the exported
    /// function stays a placeholder of the kernel, resolved by [CppTemplateKernel::finalize].
    ///
    /// A failed render leaves the arguments and hooks of the kernel as they were.
    pub fn render(&self, kernel: &mut CppTemplateKernel, inputs: &BmmInputs) -> Result<String> {
        let b_index = SizeVar::new("s_b_index");
        let marker = format!("FOR_BMM_{}>", b_index.id());
        let args = kernel.args.clone();
        let num_hooks = kernel.render_hooks.len();

        let code = match self.render_items(kernel, inputs, &b_index) {
            Ok(code) => {
                let hooks = kernel.render_hooks.take_matching(&marker);
                log::debug!("Resolving {:?} of {}", hooks, kernel.kernel_name());
                PartialRender::new(code, hooks).finalize_all(&kernel.args)
            }
            Err(err) => Err(err),
        };

        match code {
            Ok(code) => {
                if kernel.args.contains_sizevar(&b_index) {
                    kernel.args.remove_sizevar(&b_index)?;
                }
                Ok(code)
            }
            Err(err) => {
                log::debug!("Rendering {} failed, restoring its kernel", kernel.kernel_name());
                kernel.render_hooks.truncate(num_hooks);
                kernel.args = args;
                Err(err)
            }
        }
    }

    /// Prepare the weight, render and finalize a complete kernel.
    pub fn generate(&self, kernel_name: &str, inputs: &BmmInputs) -> Result<BmmKernel> {
        let weight = self.prep_weight(&inputs.w)?;
        let inputs = BmmInputs {
            w: weight.weight().clone(),
            ..inputs.clone()
        };

        let mut kernel = CppTemplateKernel::new(kernel_name);
        let code = self.render(&mut kernel, &inputs)?;
        let source = kernel.finalize(code)?;

        log::info!("Generated BMM kernel {kernel_name}");
        Ok(BmmKernel::new(source, weight))
    }

    fn render_items(
        &self,
        kernel: &mut CppTemplateKernel,
        inputs: &BmmInputs,
        b_index: &SizeVar,
    ) -> Result<String> {
        let id = b_index.id();
        let options = self.options(b_index, inputs)?;
        // Items of the parallel loop must not spawn threads of their own.
        let single_options = RenderOptions {
            num_threads: 1,
            ..options.clone()
        };

        let micro = self.gemm.render_microkernel_def(&options)?;

        let threaded_def = kernel.def_kernel(
            options
                .kernel_def()
                .with_function_name("threaded_mm")
                .with_extra_sizevars(vec![b_index.clone()])
                .with_placeholder(format!("<THREADED_MM_DEF_FOR_BMM_{id}>")),
        )?;
        let threaded = self.gemm.render_gemm(kernel, &options, &threaded_def)?;

        let single_def = kernel.def_kernel(
            single_options
                .kernel_def()
                .with_function_name("single_thread_mm")
                .with_extra_sizevars(vec![b_index.clone()])
                .with_placeholder(format!("<SINGLE_THREAD_DEF_MM_FOR_BMM_{id}>")),
        )?;
        let single = self.gemm.render_gemm(kernel, &single_options, &single_def)?;

        let (bx, bw, by, by_2d) = batched_operands(&options)?;
        let signature = kernel.def_kernel(gemm_kernel_def(
            bx,
            bw,
            options.bias.as_ref(),
            by,
            &options.epilogues,
        ))?;
        let batch = kernel.size(by_2d, 0)?;
        let single_call = gemm_function_call(
            kernel,
            b_index,
            "single_thread_mm",
            &format!("<SINGLE_THREAD_CALL_FOR_BMM_{id}>"),
            "b_start",
        )?;
        let threaded_call = gemm_function_call(
            kernel,
            b_index,
            "threaded_mm",
            &format!("<THREADED_MM_CALL_FOR_BMM_{id}>"),
            "b_start",
        )?;
        let wrapper = render_wrapper(
            &signature,
            &batch,
            options.num_threads,
            &single_call,
            &threaded_call,
        )?;

        Ok(format!("{micro}\n\n{threaded}\n\n{single}\n\n{wrapper}\n"))
    }
}

fn check_rank(tensor: &TensorDesc, ranks: &[usize]) -> Result<()> {
    if ranks.contains(&tensor.rank()) {
        return Ok(());
    }

    Err(TemplateError::malformed(
        &tensor.name,
        format!("expected rank {ranks:?}, got {}", tensor.rank()),
    ))
}

fn check_extent(tensor: &TensorDesc, dim: usize, expected: &SymExpr, what: &str) -> Result<()> {
    let actual = tensor.size(dim)?;
    if actual == expected {
        return Ok(());
    }

    Err(TemplateError::malformed(
        &tensor.name,
        format!("{what} is {actual}, expected {expected}"),
    ))
}

/// Operands must agree on the batch and matrix extents.
fn check_extents(inputs: &BmmInputs) -> Result<()> {
    let BmmInputs {
        x,
        w,
        y,
        bias,
        epilogues,
    } = inputs;

    let batch = x.size(0)?;
    let (m, k, n) = (x.size(1)?, x.size(2)?, y.size(2)?);
    check_extent(w, 0, batch, "batch")?;
    check_extent(y, 0, batch, "batch")?;
    check_extent(y, 1, m, "m")?;

    if w.rank() == 4 {
        check_extent(w, 2, k, "k")?;
        let padded_n = w.static_size(1)? * w.static_size(3)?;
        let columns = y.static_size(2)?;
        if padded_n < columns {
            return Err(TemplateError::malformed(
                &w.name,
                format!("blocked n is {padded_n}, expected at least {columns}"),
            ));
        }
    } else {
        check_extent(w, 1, k, "k")?;
        check_extent(w, 2, n, "n")?;
    }

    if let Some(bias) = bias {
        check_extent(bias, 0, n, "n")?;
    }
    for epilogue in epilogues.iter() {
        for (dim, size) in y.sizes.iter().enumerate() {
            check_extent(&epilogue.output, dim, size, "epilogue extent")?;
        }
    }

    Ok(())
}

fn batched_operands(
    options: &RenderOptions,
) -> Result<(&TensorDesc, &TensorDesc, &TensorDesc, &TensorDesc)> {
    match (&options.bx, &options.bw, &options.by, &options.by_2d) {
        (Some(bx), Some(bw), Some(by), Some(by_2d)) => Ok((bx, bw, by, by_2d)),
        _ => Err(TemplateError::malformed(
            &options.y.name,
            "options carry no batched operands",
        )),
    }
}
