use crate::{
    bmm::{BmmInputs, BmmKernel, CppBmmTemplate},
    error::{ConfigError, GenerateError},
    gemm::{CppGemmTemplate, Epilogue, EpilogueOp, GemmBlocking, LayoutType, MicroGemm},
    ir::{DType, SizeVar, SymExpr, TensorDesc, TensorSource},
};
use core::fmt::Display;
use serde::{Deserialize, Serialize};

/// Configuration trait.
pub trait Config: core::fmt::Debug + Serialize + serde::de::DeserializeOwned {
    /// Saves the configuration to a file.
    fn save<P: AsRef<std::path::Path>>(&self, file: P) -> std::io::Result<()> {
        let json = config_to_json(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(file, json)
    }

    /// Loads the configuration from a file.
    fn load<P: AsRef<std::path::Path>>(file: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(file.as_ref())
            .map_err(|_| ConfigError::FileNotFound(file.as_ref().to_string_lossy().to_string()))?;
        config_from_str(&content)
    }

    /// Loads the configuration from a binary buffer.
    fn load_binary(data: &[u8]) -> Result<Self, ConfigError> {
        let content = core::str::from_utf8(data).map_err(|_| {
            ConfigError::InvalidFormat("Could not parse data as utf-8.".to_string())
        })?;
        config_from_str(content)
    }
}

/// Converts a configuration to a JSON string.
pub fn config_to_json<C: Config>(config: &C) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(config).map_err(|err| ConfigError::InvalidFormat(format!("{err}")))
}

fn config_from_str<C: Config>(content: &str) -> Result<C, ConfigError> {
    serde_json::from_str(content).map_err(|err| ConfigError::InvalidFormat(format!("{err}")))
}

/// Size of the batch dimension: a number, or the name of a size variable known at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchSize {
    Static(usize),
    Symbolic(String),
}

/// Description of a BMM kernel to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmmConfig {
    pub kernel_name: String,
    pub num_threads: usize,
    pub batch: BatchSize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub dtype: DType,
    /// Weight layout required by the micro-kernel.
    pub layout: LayoutType,
    pub register_blocking: GemmBlocking,
    pub alpha: f32,
    pub beta: f32,
    pub bias: bool,
    /// The weight is a graph constant, blocked once by constant folding.
    pub constant_weight: bool,
    /// The weight is stored column-major.
    pub transposed_weight: bool,
    pub epilogues: Vec<EpilogueOp>,
}

impl Config for BmmConfig {}

impl Default for BmmConfig {
    fn default() -> Self {
        Self {
            kernel_name: "bmm".to_string(),
            num_threads: 1,
            batch: BatchSize::Static(1),
            m: 32,
            n: 64,
            k: 64,
            dtype: DType::F32,
            layout: LayoutType::Normal,
            register_blocking: GemmBlocking::default(),
            alpha: 1.0,
            beta: 1.0,
            bias: false,
            constant_weight: false,
            transposed_weight: false,
            epilogues: Vec::new(),
        }
    }
}

impl Display for BmmConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let json = config_to_json(self).map_err(|_| core::fmt::Error)?;
        f.write_str(&json)
    }
}

impl BmmConfig {
    pub fn with_kernel_name<S: Into<String>>(mut self, name: S) -> Self {
        self.kernel_name = name.into();
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_batch(mut self, batch: BatchSize) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the matrix sizes: `X [m, k]`, `W [k, n]`.
    pub fn with_shape(mut self, m: usize, n: usize, k: usize) -> Self {
        self.m = m;
        self.n = n;
        self.k = k;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_layout(mut self, layout: LayoutType) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_register_blocking(mut self, blocking: GemmBlocking) -> Self {
        self.register_blocking = blocking;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Adds a bias scaled by `beta`.
    pub fn with_bias(mut self, beta: f32) -> Self {
        self.bias = true;
        self.beta = beta;
        self
    }

    pub fn with_constant_weight(mut self, constant: bool) -> Self {
        self.constant_weight = constant;
        self
    }

    pub fn with_transposed_weight(mut self, transposed: bool) -> Self {
        self.transposed_weight = transposed;
        self
    }

    pub fn with_epilogue(mut self, op: EpilogueOp) -> Self {
        self.epilogues.push(op);
        self
    }

    /// Checks the values can describe a kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidValue(reason));

        if !is_identifier(&self.kernel_name) {
            return invalid(format!(
                "kernel name {:?} is not a C identifier",
                self.kernel_name
            ));
        }
        if self.num_threads == 0 {
            return invalid("num_threads must be at least 1".to_string());
        }
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return invalid(format!(
                "matrix sizes must be positive, got m={}, n={}, k={}",
                self.m, self.n, self.k
            ));
        }
        if self.register_blocking.block_m == 0 || self.register_blocking.block_n == 0 {
            return invalid(format!(
                "register blocking must be positive, got {:?}",
                self.register_blocking
            ));
        }
        if let BatchSize::Symbolic(name) = &self.batch {
            if !is_identifier(name) {
                return invalid(format!("batch size {name:?} is not a C identifier"));
            }
            if name == "s_b_index" {
                return invalid("s_b_index is reserved for the batch index".to_string());
            }
        }

        Ok(())
    }

    /// The micro-kernel the GEMM calls.
    pub fn micro_gemm(&self) -> MicroGemm {
        MicroGemm::new(
            format!("{}_micro_gemm", self.kernel_name),
            self.dtype,
            self.dtype,
            self.dtype.acc_type(),
            self.register_blocking,
            self.layout,
        )
    }

    pub fn template(&self) -> CppBmmTemplate<CppGemmTemplate> {
        let gemm = CppGemmTemplate::new(self.micro_gemm(), self.num_threads, self.alpha, self.beta);
        CppBmmTemplate::new(gemm)
    }

    /// Descriptors of the operands: `arg0_1 [b, m, k]`, `arg1_1 [b, k, n]`, an optional bias
    /// `arg2_1 [n]` and `buf0 [b, m, n]`, followed by one buffer per epilogue.
    pub fn inputs(&self) -> BmmInputs {
        let batch = match &self.batch {
            BatchSize::Static(size) => SymExpr::from(*size),
            BatchSize::Symbolic(name) => SymExpr::from(SizeVar::new(name.clone())),
        };
        let (m, n, k) = (SymExpr::from(self.m), SymExpr::from(self.n), SymExpr::from(self.k));
        let computed = |name: &str, sizes: Vec<SymExpr>| {
            TensorDesc::contiguous(name, self.dtype, sizes, TensorSource::Computed)
        };

        let x = computed("arg0_1", vec![batch.clone(), m.clone(), k.clone()]);
        let y = computed("buf0", vec![batch.clone(), m.clone(), n.clone()]);

        let (w_name, w_source) = if self.constant_weight {
            ("_frozen_param0", TensorSource::Constant)
        } else {
            ("arg1_1", TensorSource::Computed)
        };
        let mut w = TensorDesc::contiguous(
            w_name,
            self.dtype,
            vec![batch.clone(), k.clone(), n.clone()],
            w_source,
        );
        if self.transposed_weight {
            w.strides = vec![k.clone() * n.clone(), SymExpr::Const(1), k];
        }

        let bias = self.bias.then(|| computed("arg2_1", vec![n.clone()]));
        let epilogues = self
            .epilogues
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let output = computed(
                    &format!("buf{}", i + 1),
                    vec![batch.clone(), m.clone(), n.clone()],
                );
                Epilogue::new(*op, output)
            })
            .collect();

        BmmInputs::new(x, w, y, bias, epilogues)
    }

    /// Generate the kernel this configuration describes.
    pub fn generate(&self) -> Result<BmmKernel, GenerateError> {
        self.validate()?;
        log::info!("Generating {} with {} threads", self.kernel_name, self.num_threads);

        Ok(self.template().generate(&self.kernel_name, &self.inputs())?)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = BmmConfig::load_binary(br#"{"num_threads": 4, "batch": "s0"}"#).unwrap();

        assert_eq!(config.num_threads, 4);
        assert_eq!(config.batch, BatchSize::Symbolic("s0".to_string()));
        assert_eq!(config.kernel_name, "bmm");
    }

    #[test]
    fn json_round_trip() {
        let config = BmmConfig::default()
            .with_batch(BatchSize::Static(10))
            .with_layout(LayoutType::Vnni2)
            .with_epilogue(EpilogueOp::Scale(0.5));

        let loaded = BmmConfig::load_binary(config.to_string().as_bytes()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_json_is_invalid_format() {
        assert!(matches!(
            BmmConfig::load_binary(b"{"),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            BmmConfig::load("/nonexistent/bmm.json"),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(BmmConfig::default().validate().is_ok());
        for config in [
            BmmConfig::default().with_num_threads(0),
            BmmConfig::default().with_kernel_name("2bmm"),
            BmmConfig::default().with_shape(0, 16, 16),
            BmmConfig::default().with_batch(BatchSize::Symbolic("s 0".to_string())),
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
        }
    }

    #[test]
    fn transposed_weight_strides() {
        let inputs = BmmConfig::default()
            .with_shape(8, 16, 32)
            .with_transposed_weight(true)
            .inputs();

        assert_eq!(
            inputs.w.strides,
            vec![SymExpr::Const(512), SymExpr::Const(1), SymExpr::Const(32)]
        );
        assert!(!inputs.w.is_contiguous());
    }

    #[test]
    fn symbolic_batch_is_shared() {
        let inputs = BmmConfig::default()
            .with_batch(BatchSize::Symbolic("s0".to_string()))
            .with_epilogue(EpilogueOp::Relu)
            .inputs();

        let batch = inputs.x.free_vars();
        assert_eq!(batch.len(), 1);
        assert_eq!(inputs.y.free_vars(), batch);
        assert_eq!(inputs.epilogues[0].output.free_vars(), batch);
        assert_eq!(inputs.epilogues[0].output.name, "buf1");
    }
}
