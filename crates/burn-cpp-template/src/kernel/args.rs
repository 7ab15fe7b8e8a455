use crate::{
    error::{Result, TemplateError},
    ir::{DType, SizeVar},
};

/// What the caller passes for a kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// A buffer, by name.
    Buffer(String),
    /// The value of a size variable.
    SizeVar(SizeVar),
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
struct BufferArg {
    buffer: String,
    param: String,
    dtype: DType,
}

/// Arguments of the kernel functions being generated.
///
/// Buffers keep the parameter name they were first registered with. Size variables are passed
/// by their own name, so two different symbols can't share a name while registered.
#[derive(Default, Debug, Clone)]
pub struct KernelArgs {
    inputs: Vec<BufferArg>,
    outputs: Vec<BufferArg>,
    sizevars: Vec<SizeVar>,
}

impl KernelArgs {
    /// Register an input buffer under the given parameter name.
    pub fn input(&mut self, buffer: &str, param: &str, dtype: DType) {
        if self.param(buffer).is_none() {
            log::trace!("Kernel input {buffer} as {param}");
            self.inputs
                .push(BufferArg::new(buffer.to_string(), param.to_string(), dtype));
        }
    }

    /// Register an output buffer under the given parameter name.
    pub fn output(&mut self, buffer: &str, param: &str, dtype: DType) {
        if self.param(buffer).is_none() {
            log::trace!("Kernel output {buffer} as {param}");
            self.outputs
                .push(BufferArg::new(buffer.to_string(), param.to_string(), dtype));
        }
    }

    /// Parameter name of a registered buffer.
    pub fn param(&self, buffer: &str) -> Option<&str> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|arg| arg.buffer == buffer)
            .map(|arg| arg.param.as_str())
    }

    /// Register a size variable, returning its parameter name.
    ///
    /// Registering the same variable twice is a no-op.
    pub fn sizevar(&mut self, var: &SizeVar) -> Result<&str> {
        let position = match self.sizevars.iter().position(|current| current.name() == var.name()) {
            Some(position) if &self.sizevars[position] == var => position,
            Some(_) => {
                return Err(TemplateError::SizeVarInUse {
                    name: var.name().to_string(),
                })
            }
            None => {
                self.sizevars.push(var.clone());
                self.sizevars.len() - 1
            }
        };

        Ok(self.sizevars[position].name())
    }

    pub fn contains_sizevar(&self, var: &SizeVar) -> bool {
        self.sizevars.contains(var)
    }

    /// Deregister a size variable so it no longer appears in signatures.
    pub fn remove_sizevar(&mut self, var: &SizeVar) -> Result<()> {
        let position = self
            .sizevars
            .iter()
            .position(|current| current == var)
            .ok_or_else(|| TemplateError::UnknownSizeVar(var.clone()))?;

        self.sizevars.remove(position);
        log::trace!("Size variable {var} released");
        Ok(())
    }

    /// Parameter names, call arguments and C++ declarations, in signature order.
    pub fn argdefs(&self) -> (Vec<String>, Vec<CallArg>, Vec<String>) {
        let mut names = Vec::new();
        let mut call_args = Vec::new();
        let mut decls = Vec::new();

        for arg in self.inputs.iter() {
            names.push(arg.param.clone());
            call_args.push(CallArg::Buffer(arg.buffer.clone()));
            decls.push(format!("const {}* {}", arg.dtype.cpp_type(), arg.param));
        }
        for arg in self.outputs.iter() {
            names.push(arg.param.clone());
            call_args.push(CallArg::Buffer(arg.buffer.clone()));
            decls.push(format!("{}* {}", arg.dtype.cpp_type(), arg.param));
        }
        for var in self.sizevars.iter() {
            names.push(var.name().to_string());
            call_args.push(CallArg::SizeVar(var.clone()));
            decls.push(format!("const int64_t {}", var.name()));
        }

        (names, call_args, decls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argdefs_follow_registration_order() {
        let mut args = KernelArgs::default();
        let batch = SizeVar::new("s_b_index");
        args.input("arg0_1", "X", DType::F32);
        args.input("arg1_1", "W", DType::BF16);
        args.output("buf0", "Y", DType::F32);
        args.sizevar(&batch).unwrap();

        let (names, call_args, decls) = args.argdefs();

        assert_eq!(names, vec!["X", "W", "Y", "s_b_index"]);
        assert_eq!(call_args[3], CallArg::SizeVar(batch));
        assert_eq!(
            decls,
            vec![
                "const float* X",
                "const bfloat16* W",
                "float* Y",
                "const int64_t s_b_index"
            ]
        );
    }

    #[test]
    fn buffers_keep_their_first_parameter_name() {
        let mut args = KernelArgs::default();
        args.input("arg0_1", "X", DType::F32);
        args.input("arg0_1", "other", DType::F32);

        assert_eq!(args.param("arg0_1"), Some("X"));
        assert_eq!(args.argdefs().0.len(), 1);
    }

    #[test]
    fn same_sizevar_registers_once() {
        let mut args = KernelArgs::default();
        let batch = SizeVar::new("s_b_index");
        args.sizevar(&batch).unwrap();
        args.sizevar(&batch).unwrap();

        assert_eq!(args.argdefs().0, vec!["s_b_index"]);
    }

    #[test]
    fn reused_sizevar_name_fails() {
        let mut args = KernelArgs::default();
        args.sizevar(&SizeVar::new("s_b_index")).unwrap();

        let err = args.sizevar(&SizeVar::new("s_b_index")).unwrap_err();

        assert!(matches!(err, TemplateError::SizeVarInUse { .. }));
    }

    #[test]
    fn removing_unknown_sizevar_fails() {
        let mut args = KernelArgs::default();
        let batch = SizeVar::new("s_b_index");
        args.sizevar(&batch).unwrap();
        args.remove_sizevar(&batch).unwrap();

        assert!(!args.contains_sizevar(&batch));
        assert!(matches!(
            args.remove_sizevar(&batch),
            Err(TemplateError::UnknownSizeVar(_))
        ));
    }
}
