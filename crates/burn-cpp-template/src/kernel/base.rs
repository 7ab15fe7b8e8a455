use super::{KernelArgs, PartialRender, RenderHooks};
use crate::{
    error::{Result, TemplateError},
    ir::{SizeVar, SymExpr, TensorDesc},
};
use minijinja::{Environment, UndefinedBehavior, Value};

/// Placeholder used by [def_kernel](CppTemplateKernel::def_kernel) when none is given.
pub const DEF_KERNEL_PLACEHOLDER: &str = "<DEF_KERNEL>";

/// Signature of a function defined in the kernel source.
#[derive(Default, Debug, Clone)]
pub struct KernelDef {
    inputs: Vec<(String, TensorDesc)>,
    outputs: Vec<(String, TensorDesc)>,
    function_name: Option<String>,
    extra_sizevars: Vec<SizeVar>,
    placeholder: Option<String>,
}

impl KernelDef {
    /// Add an input tensor passed as `param`.
    pub fn input<S: Into<String>>(mut self, param: S, tensor: &TensorDesc) -> Self {
        self.inputs.push((param.into(), tensor.clone()));
        self
    }

    /// Add an output tensor passed as `param`.
    pub fn output<S: Into<String>>(mut self, param: S, tensor: &TensorDesc) -> Self {
        self.outputs.push((param.into(), tensor.clone()));
        self
    }

    /// Name of the function, the kernel name by default.
    pub fn with_function_name<S: Into<String>>(mut self, name: S) -> Self {
        self.function_name = Some(name.into());
        self
    }

    /// Size variables passed as arguments even if no tensor mentions them.
    pub fn with_extra_sizevars(mut self, vars: Vec<SizeVar>) -> Self {
        self.extra_sizevars = vars;
        self
    }

    pub fn with_placeholder<S: Into<String>>(mut self, placeholder: S) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }
}

/// The kernel being generated: a shared argument list and the placeholders still to resolve.
///
/// Every function defined in the same kernel source takes the same arguments, so signatures are
/// rendered lazily once the whole source is known.
#[derive(Debug)]
pub struct CppTemplateKernel {
    kernel_name: String,
    pub args: KernelArgs,
    pub render_hooks: RenderHooks,
}

impl CppTemplateKernel {
    pub fn new<S: Into<String>>(kernel_name: S) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            args: KernelArgs::default(),
            render_hooks: RenderHooks::default(),
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Register the arguments of a function and return the placeholder of its signature.
    pub fn def_kernel(&mut self, def: KernelDef) -> Result<String> {
        for (param, tensor) in def.inputs.iter() {
            self.args.input(&tensor.name, param, tensor.dtype);
            self.register_vars(tensor.free_vars())?;
        }
        for (param, tensor) in def.outputs.iter() {
            self.args.output(&tensor.name, param, tensor.dtype);
            self.register_vars(tensor.free_vars())?;
        }
        self.register_vars(def.extra_sizevars)?;

        let placeholder = def
            .placeholder
            .unwrap_or_else(|| DEF_KERNEL_PLACEHOLDER.to_string());
        let function_name = def
            .function_name
            .unwrap_or_else(|| self.kernel_name.clone());

        log::debug!("Defining {function_name} at {placeholder}");
        self.render_hooks.register(
            placeholder.clone(),
            Box::new(move |args: &KernelArgs| {
                let (_, _, decls) = args.argdefs();
                Ok(format!("void {function_name}({})", decls.join(", ")))
            }),
        )?;

        Ok(placeholder)
    }

    /// C++ expression of a tensor size.
    pub fn size(&mut self, tensor: &TensorDesc, dim: usize) -> Result<String> {
        let size = tensor.size(dim)?.clone();
        self.register_vars(size.free_vars())?;
        Ok(size.to_string())
    }

    /// C++ expression of a tensor stride.
    pub fn stride(&mut self, tensor: &TensorDesc, dim: usize) -> Result<String> {
        let stride = tensor.stride(dim)?.clone();
        self.register_vars(stride.free_vars())?;
        Ok(stride.to_string())
    }

    /// C++ pointer to the first element of a tensor.
    pub fn ptr(&mut self, tensor: &TensorDesc) -> Result<String> {
        let param = self.param(tensor)?;
        self.register_vars(tensor.offset.free_vars())?;

        if tensor.offset.is_zero() {
            Ok(param)
        } else {
            Ok(format!("{param} + {}", tensor.offset))
        }
    }

    /// C++ lvalue of a tensor element.
    pub fn index(&mut self, tensor: &TensorDesc, indices: &[SymExpr]) -> Result<String> {
        if indices.len() != tensor.rank() {
            return Err(TemplateError::malformed(
                &tensor.name,
                format!(
                    "expected {} indices, got {}",
                    tensor.rank(),
                    indices.len()
                ),
            ));
        }

        let param = self.param(tensor)?;
        let offset = indices
            .iter()
            .zip(tensor.strides.iter())
            .fold(tensor.offset.clone(), |acc, (index, stride)| {
                acc + index.clone() * stride.clone()
            });
        self.register_vars(offset.free_vars())?;

        Ok(format!("{param}[{offset}]"))
    }

    /// View of a tensor at `index` along `dim`.
    pub fn select(&self, tensor: &TensorDesc, dim: usize, index: SymExpr) -> Result<TensorDesc> {
        tensor.select(dim, index)
    }

    /// Resolve every remaining placeholder of `code`.
    pub fn finalize(&mut self, code: String) -> Result<String> {
        let hooks = self.render_hooks.take_all();
        PartialRender::new(code, hooks).finalize_all(&self.args)
    }

    fn param(&self, tensor: &TensorDesc) -> Result<String> {
        self.args
            .param(&tensor.name)
            .map(str::to_string)
            .ok_or_else(|| TemplateError::UnknownBuffer(tensor.name.clone()))
    }

    fn register_vars(&mut self, vars: Vec<SizeVar>) -> Result<()> {
        for var in vars.iter() {
            self.args.sizevar(var)?;
        }
        Ok(())
    }
}

/// Render a source template, failing on any undefined variable.
pub(crate) fn render_source(
    name: &'static str,
    source: &'static str,
    ctx: Value,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(name, source)?;

    Ok(env.get_template(name)?.render(ctx)?)
}
