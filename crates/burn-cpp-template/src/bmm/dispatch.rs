use crate::{
    error::{Result, TemplateError},
    kernel::render_source,
};
use core::ops::Range;
use minijinja::context;

/// Split of a batch between the single-thread and the threaded GEMM.
///
/// The largest multiple of the thread count runs one single-thread GEMM per item in parallel.
/// The remainder, fewer items than threads, runs the threaded GEMM item by item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPartition {
    batch: usize,
    num_threads: usize,
}

impl BatchPartition {
    pub fn new(batch: usize, num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(TemplateError::InvalidThreads(num_threads));
        }

        Ok(Self { batch, num_threads })
    }

    /// Number of items handled by the single-thread GEMM.
    pub fn single_thread_block(&self) -> usize {
        (self.batch / self.num_threads) * self.num_threads
    }

    pub fn single_thread_range(&self) -> Range<usize> {
        0..self.single_thread_block()
    }

    pub fn threaded_range(&self) -> Range<usize> {
        self.single_thread_block()..self.batch
    }
}

const BMM_WRAPPER: &str = r#"extern "C"
{{ signature }}
{
    const int64_t B = {{ batch }};
{%- if num_threads > 1 %}
    constexpr int64_t num_threads = {{ num_threads }};
    int64_t B_single_thread_block = (B / num_threads) * num_threads;

    #pragma omp parallel for num_threads({{ num_threads }})
{%- else %}
    int64_t B_single_thread_block = B;
{%- endif %}
    for (int64_t b_start = 0; b_start < B_single_thread_block; ++b_start) {
        {{ single_thread_call }}
    }
    for (int64_t b_start = B_single_thread_block; b_start < B; ++b_start) {
        {{ threaded_call }}
    }
}
"#;

/// The exported function looping over the batch, following [BatchPartition].
pub fn render_wrapper(
    signature: &str,
    batch: &str,
    num_threads: usize,
    single_thread_call: &str,
    threaded_call: &str,
) -> Result<String> {
    if num_threads == 0 {
        return Err(TemplateError::InvalidThreads(num_threads));
    }

    render_source(
        "bmm_wrapper",
        BMM_WRAPPER,
        context!(
            signature => signature,
            batch => batch,
            num_threads => num_threads,
            single_thread_call => single_thread_call,
            threaded_call => threaded_call,
        ),
    )
}
