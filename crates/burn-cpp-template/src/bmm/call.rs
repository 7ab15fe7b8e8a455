use crate::{
    error::{Result, TemplateError},
    ir::SizeVar,
    kernel::{CallArg, CppTemplateKernel, KernelArgs},
};

/// Call of a per-item GEMM function, the batch index argument replaced by `batch_expr`.
///
/// The call is rendered when `placeholder` is resolved, once every argument of the kernel is
/// known. The placeholder is returned so it can be embedded in the kernel text.
pub fn gemm_function_call(
    kernel: &mut CppTemplateKernel,
    b_index: &SizeVar,
    function_name: &str,
    placeholder: &str,
    batch_expr: &str,
) -> Result<String> {
    let b_index = b_index.clone();
    let function_name = function_name.to_string();
    let batch_expr = batch_expr.to_string();

    kernel.render_hooks.register(
        placeholder,
        Box::new(move |args: &KernelArgs| {
            let (mut names, call_args, _) = args.argdefs();

            let position = call_args
                .iter()
                .position(|arg| matches!(arg, CallArg::SizeVar(var) if *var == b_index))
                .ok_or_else(|| TemplateError::UnboundSizeVar {
                    var: b_index.clone(),
                    function: function_name.clone(),
                })?;
            names[position] = batch_expr;

            Ok(format!("{function_name}({});", names.join(", ")))
        }),
    )?;

    Ok(placeholder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DType, SymExpr, TensorDesc, TensorSource};
    use crate::kernel::KernelDef;

    fn kernel_with_batch(b_index: &SizeVar) -> CppTemplateKernel {
        let mut kernel = CppTemplateKernel::new("bmm");
        let x = TensorDesc::contiguous(
            "arg0_1",
            DType::F32,
            vec![SymExpr::Const(4), SymExpr::Const(8)],
            TensorSource::Computed,
        );
        kernel
            .def_kernel(
                KernelDef::default()
                    .input("X", &x)
                    .with_extra_sizevars(vec![b_index.clone()])
                    .with_placeholder("<DEF>"),
            )
            .unwrap();
        kernel
    }

    #[test]
    fn batch_argument_is_replaced() {
        let b_index = SizeVar::new("s_b_index");
        let mut kernel = kernel_with_batch(&b_index);

        let placeholder =
            gemm_function_call(&mut kernel, &b_index, "single_thread_mm", "<CALL>", "b_start")
                .unwrap();
        let code = kernel.finalize(placeholder).unwrap();

        assert_eq!(code, "single_thread_mm(X, b_start);");
    }

    #[test]
    fn duplicate_call_placeholder_fails() {
        let b_index = SizeVar::new("s_b_index");
        let mut kernel = kernel_with_batch(&b_index);
        gemm_function_call(&mut kernel, &b_index, "threaded_mm", "<CALL>", "b_start").unwrap();

        let err = gemm_function_call(&mut kernel, &b_index, "threaded_mm", "<CALL>", "b_start")
            .unwrap_err();

        assert!(matches!(err, TemplateError::DuplicatePlaceholder(_)));
    }

    #[test]
    fn released_batch_index_is_unbound() {
        let b_index = SizeVar::new("s_b_index");
        let mut kernel = kernel_with_batch(&b_index);
        gemm_function_call(&mut kernel, &b_index, "threaded_mm", "<CALL>", "b_start").unwrap();
        kernel.args.remove_sizevar(&b_index).unwrap();

        let err = kernel.finalize("<CALL>".to_string()).unwrap_err();

        assert!(matches!(
            err,
            TemplateError::UnboundSizeVar { function, .. } if function == "threaded_mm"
        ));
    }
}
