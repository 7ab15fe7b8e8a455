use super::{default_reindexers, Epilogue, GemmBlocking, MicroGemm, Reindexer};
use crate::{
    error::{Result, TemplateError},
    ir::{SizeVar, SymExpr, TensorDesc},
    kernel::{render_source, CppTemplateKernel, KernelDef},
};
use minijinja::context;
use serde::Serialize;
use std::sync::Arc;

/// Operands of a GEMM `Y = alpha * X * W + beta * bias`, followed by epilogues.
#[derive(new, Debug, Clone)]
pub struct GemmInputs {
    pub x: TensorDesc,
    /// The weight, already prepared for the micro-kernel.
    pub w: TensorDesc,
    pub y: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub epilogues: Vec<Epilogue>,
}

/// Values a GEMM template is rendered with.
///
/// Batched templates keep the unsliced operands in the `B*` fields and the batch index they were
/// sliced with.
#[derive(Debug, Clone, Serialize)]
pub struct RenderOptions {
    #[serde(rename = "X")]
    pub x: TensorDesc,
    #[serde(rename = "W")]
    pub w: TensorDesc,
    #[serde(rename = "Y")]
    pub y: TensorDesc,
    #[serde(rename = "GemmOut")]
    pub gemm_out: TensorDesc,
    #[serde(rename = "Y_2d")]
    pub y_2d: TensorDesc,
    #[serde(rename = "inp")]
    pub bias: Option<TensorDesc>,
    #[serde(rename = "BX")]
    pub bx: Option<TensorDesc>,
    #[serde(rename = "BW")]
    pub bw: Option<TensorDesc>,
    #[serde(rename = "BY")]
    pub by: Option<TensorDesc>,
    #[serde(rename = "BY_2d")]
    pub by_2d: Option<TensorDesc>,
    pub b_index: Option<SizeVar>,
    pub x_dtype: &'static str,
    pub w_dtype: &'static str,
    pub y_dtype: &'static str,
    pub acc_dtype: &'static str,
    pub num_threads: usize,
    pub blocking: GemmBlocking,
    pub alpha: f32,
    pub beta: f32,
    pub m: SymExpr,
    pub n: usize,
    pub k: usize,
    pub padded_n: usize,
    pub epilogues: Vec<Epilogue>,
    #[serde(skip)]
    pub reindexers: Vec<Arc<dyn Reindexer>>,
}

impl RenderOptions {
    /// Signature of a function taking the operands of these options.
    pub fn kernel_def(&self) -> KernelDef {
        gemm_kernel_def(&self.x, &self.w, self.bias.as_ref(), &self.y, &self.epilogues)
    }
}

/// Signature shared by the functions of a GEMM kernel.
pub fn gemm_kernel_def(
    x: &TensorDesc,
    w: &TensorDesc,
    bias: Option<&TensorDesc>,
    y: &TensorDesc,
    epilogues: &[Epilogue],
) -> KernelDef {
    let mut def = KernelDef::default().input("X", x).input("W", w);
    if let Some(bias) = bias {
        def = def.input("inp", bias);
    }
    def = def.output("Y", y);

    epilogues
        .iter()
        .enumerate()
        .fold(def, |def, (i, epilogue)| {
            def.output(format!("Y_epilogue_{i}"), &epilogue.output)
        })
}

/// Padded and blocked size of a 2-D weight `[k, n]`.
///
/// Blocking splits the columns into `[n_blocks, k, block_n]` panels, padding `n` up to a
/// multiple of `block_n`. Returns the new size and the padded `n`.
pub fn padded_size(n: usize, block_n: usize, k: usize, should_block: bool) -> (Vec<i64>, usize) {
    if !should_block {
        return (vec![k as i64, n as i64], n);
    }

    let padded_n = match n % block_n {
        0 => n,
        modulo => n + block_n - modulo,
    };
    let new_size = vec![(padded_n / block_n) as i64, k as i64, block_n as i64];

    (new_size, padded_n)
}

/// A template rendering a single GEMM function.
pub trait GemmTemplate {
    fn micro_gemm(&self) -> &MicroGemm;

    fn num_threads(&self) -> usize;

    /// See [padded_size].
    fn padded_size(
        &self,
        n: usize,
        block_n: usize,
        k: usize,
        should_block: bool,
    ) -> (Vec<i64>, usize) {
        padded_size(n, block_n, k, should_block)
    }

    /// Build the render options. Operands may carry leading dimensions, the last two being the
    /// matrix.
    fn options(
        &self,
        inputs: &GemmInputs,
        reindexers: Vec<Arc<dyn Reindexer>>,
    ) -> Result<RenderOptions>;

    /// Definition of the micro-kernel called by the GEMM.
    fn render_microkernel_def(&self, _options: &RenderOptions) -> Result<String> {
        self.micro_gemm().codegen_define()
    }

    /// The GEMM function, defined with the given signature. Operands must be 2-D.
    fn render_gemm(
        &self,
        kernel: &mut CppTemplateKernel,
        options: &RenderOptions,
        signature: &str,
    ) -> Result<String>;
}

const GEMM_TEMPLATE: &str = r#"{{ signature }}
{
    constexpr int64_t Mr = {{ block_m }};
    constexpr int64_t Nr = {{ block_n }};
    const int64_t M = {{ m }};
    constexpr int64_t N = {{ n }};
    constexpr int64_t K = {{ k }};
    constexpr int64_t Nb = (N + Nr - 1) / Nr;
{%- if num_threads > 1 %}
    #pragma omp parallel for collapse(2) num_threads({{ num_threads }})
{%- endif %}
    for (int64_t m_start = 0; m_start < M; m_start += Mr) {
        for (int64_t nb = 0; nb < Nb; ++nb) {
            const int64_t n_start = nb * Nr;
            const int64_t m_size = M - m_start < Mr ? M - m_start : Mr;
            const int64_t n_size = N - n_start < Nr ? N - n_start : Nr;
            alignas(64) {{ acc_t }} acc[Mr * Nr];
            {{ micro }}(
                &{{ x_tile }},
                &{{ w_tile }},
                acc,
                m_size,
                n_size,
                K,
                {{ lda }},
                {{ ldb }},
                Nr
            );
            for (int64_t m = 0; m < m_size; ++m) {
                const int64_t row = m_start + m;
                for (int64_t n = 0; n < n_size; ++n) {
                    const int64_t col = n_start + n;
                    {{ acc_t }} tmp = acc[m * Nr + n]{% if alpha %} * static_cast<{{ acc_t }}>({{ alpha }}){% endif %};
{%- if bias %}
                    tmp += static_cast<{{ acc_t }}>({{ beta }}) * static_cast<{{ acc_t }}>({{ bias }});
{%- endif %}
                    {{ y }} = static_cast<{{ y_t }}>(tmp);
{%- for epilogue in epilogues %}
                    tmp = {{ epilogue.value }};
                    {{ epilogue.store }} = static_cast<{{ epilogue.ty }}>(tmp);
{%- endfor %}
                }
            }
        }
    }
}"#;

#[derive(Serialize)]
struct EpilogueStore {
    value: String,
    store: String,
    ty: &'static str,
}

/// Reference GEMM template: a blocked loop nest around a scalar micro-kernel.
#[derive(new, Debug, Clone)]
pub struct CppGemmTemplate {
    micro: MicroGemm,
    num_threads: usize,
    alpha: f32,
    beta: f32,
}

impl CppGemmTemplate {
    /// Render a complete GEMM kernel: the micro-kernel and an exported GEMM function.
    pub fn render(&self, kernel: &mut CppTemplateKernel, inputs: &GemmInputs) -> Result<String> {
        let options = self.options(inputs, default_reindexers(inputs.epilogues.len()))?;
        let signature = kernel.def_kernel(options.kernel_def())?;

        let micro = self.render_microkernel_def(&options)?;
        let gemm = self.render_gemm(kernel, &options, &signature)?;

        Ok(format!("{micro}\n\nextern \"C\"\n{gemm}\n"))
    }
}

impl GemmTemplate for CppGemmTemplate {
    fn micro_gemm(&self) -> &MicroGemm {
        &self.micro
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn options(
        &self,
        inputs: &GemmInputs,
        reindexers: Vec<Arc<dyn Reindexer>>,
    ) -> Result<RenderOptions> {
        let GemmInputs {
            x,
            w,
            y,
            bias,
            epilogues,
        } = inputs;

        if x.rank() < 2 || y.rank() != x.rank() {
            return Err(TemplateError::malformed(
                &y.name,
                format!(
                    "cannot multiply a rank {} input into a rank {} output",
                    x.rank(),
                    y.rank()
                ),
            ));
        }
        self.micro.register_blocking.validate()?;
        if reindexers.len() != epilogues.len() {
            return Err(TemplateError::malformed(
                &y.name,
                format!("{} epilogues but {} reindexers", epilogues.len(), reindexers.len()),
            ));
        }

        let rank = x.rank();
        let m = x.size(rank - 2)?.clone();
        let k = x.static_size(rank - 1)?;
        let n = y.static_size(rank - 1)?;

        // A weight with one more dimension than the output is blocked: [.., n_blocks, k, block_n].
        let padded_n = if w.rank() == rank + 1 {
            w.static_size(rank - 2)? * w.static_size(rank)?
        } else {
            n
        };

        log::debug!("GEMM options: m={m}, n={n}, k={k}, padded_n={padded_n}");

        Ok(RenderOptions {
            x: x.clone(),
            w: w.clone(),
            y: y.clone(),
            gemm_out: y.clone(),
            y_2d: y.clone(),
            bias: bias.clone(),
            bx: None,
            bw: None,
            by: None,
            by_2d: None,
            b_index: None,
            x_dtype: x.dtype.cpp_type(),
            w_dtype: w.dtype.cpp_type(),
            y_dtype: y.dtype.cpp_type(),
            acc_dtype: self.micro.compute_dtype.cpp_type(),
            num_threads: self.num_threads,
            blocking: self.micro.register_blocking,
            alpha: self.alpha,
            beta: self.beta,
            m,
            n,
            k,
            padded_n,
            epilogues: epilogues.clone(),
            reindexers,
        })
    }

    fn render_gemm(
        &self,
        kernel: &mut CppTemplateKernel,
        options: &RenderOptions,
        signature: &str,
    ) -> Result<String> {
        let x = &options.x;
        let w = &options.w;
        let y = &options.y_2d;

        if x.rank() != 2 || y.rank() != 2 {
            return Err(TemplateError::malformed(
                &y.name,
                "the GEMM body expects 2-D operands",
            ));
        }

        let nb = SymExpr::index("nb");
        let n_start = SymExpr::index("n_start");
        let row = SymExpr::index("row");
        let col = SymExpr::index("col");
        let zero = SymExpr::Const(0);

        let (block_n, w_tile, ldb) = match w.rank() {
            3 => (
                w.static_size(2)?,
                kernel.index(w, &[nb, zero.clone(), zero.clone()])?,
                kernel.stride(w, 1)?,
            ),
            2 => (
                options.blocking.block_n,
                kernel.index(w, &[zero.clone(), n_start])?,
                kernel.stride(w, 0)?,
            ),
            rank => {
                return Err(TemplateError::malformed(
                    &w.name,
                    format!("expected a 2-D or blocked 3-D weight, got rank {rank}"),
                ))
            }
        };

        let bias = match &options.bias {
            Some(bias) => Some(kernel.index(bias, &[col.clone()])?),
            None => None,
        };

        let mut epilogues = Vec::with_capacity(options.epilogues.len());
        for (epilogue, reindexer) in options.epilogues.iter().zip(options.reindexers.iter()) {
            let indices = reindexer.reindex(vec![row.clone(), col.clone()]);
            epilogues.push(EpilogueStore {
                value: epilogue.op.render("tmp", options.acc_dtype),
                store: kernel.index(&epilogue.output, &indices)?,
                ty: epilogue.output.dtype.cpp_type(),
            });
        }

        let alpha = (options.alpha != 1.0).then(|| format!("{:?}", options.alpha));

        render_source(
            "gemm",
            GEMM_TEMPLATE,
            context!(
                signature => signature,
                block_m => options.blocking.block_m,
                block_n => block_n,
                m => kernel.size(x, 0)?,
                n => options.n,
                k => options.k,
                num_threads => options.num_threads,
                acc_t => options.acc_dtype,
                y_t => options.y_dtype,
                micro => self.micro.name,
                x_tile => kernel.index(x, &[SymExpr::index("m_start"), zero])?,
                w_tile => w_tile,
                lda => kernel.stride(x, 0)?,
                ldb => ldb,
                alpha => alpha,
                beta => format!("{:?}", options.beta),
                bias => bias,
                y => kernel.index(y, &[row, col])?,
                epilogues => epilogues,
            ),
        )
    }
}
