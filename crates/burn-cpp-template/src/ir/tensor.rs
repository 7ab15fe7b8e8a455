use super::{DType, SizeVar, SymExpr};
use crate::error::{Result, TemplateError};
use serde::Serialize;

/// Where the values of a tensor come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TensorSource {
    /// Computed by the graph at runtime.
    Computed,
    /// Known at compile time and folded ahead of the kernel.
    Constant,
}

/// Descriptor of a tensor operand: the buffer it lives in and how it is laid out.
///
/// Descriptors are never mutated by the generator, views such as [select](TensorDesc::select)
/// return new descriptors pointing into the same buffer.
#[derive(new, Debug, Clone, PartialEq, Serialize)]
pub struct TensorDesc {
    /// Name of the underlying buffer.
    pub name: String,
    pub dtype: DType,
    pub sizes: Vec<SymExpr>,
    pub strides: Vec<SymExpr>,
    /// Storage offset in elements.
    pub offset: SymExpr,
    pub source: TensorSource,
}

impl TensorDesc {
    /// Create a row-major descriptor starting at the beginning of its buffer.
    pub fn contiguous<S: Into<String>>(
        name: S,
        dtype: DType,
        sizes: Vec<SymExpr>,
        source: TensorSource,
    ) -> Self {
        let strides = contiguous_strides(&sizes);
        Self::new(name.into(), dtype, sizes, strides, SymExpr::Const(0), source)
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_constant(&self) -> bool {
        self.source == TensorSource::Constant
    }

    /// Whether the strides are the row-major strides of the sizes. Size-1 dimensions are ignored.
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.sizes);

        self.sizes
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(size, (stride, expected))| size.as_const() == Some(1) || stride == expected)
    }

    pub fn size(&self, dim: usize) -> Result<&SymExpr> {
        self.sizes.get(dim).ok_or_else(|| self.out_of_range(dim))
    }

    pub fn stride(&self, dim: usize) -> Result<&SymExpr> {
        self.strides.get(dim).ok_or_else(|| self.out_of_range(dim))
    }

    /// Static size of a dimension.
    pub fn static_size(&self, dim: usize) -> Result<usize> {
        let size = self.size(dim)?;

        match size.as_const() {
            Some(value) if value >= 0 => Ok(value as usize),
            _ => Err(TemplateError::malformed(
                &self.name,
                format!("dimension {dim} must be static, got {size}"),
            )),
        }
    }

    /// View of the tensor at `index` along `dim`, removing that dimension.
    pub fn select(&self, dim: usize, index: SymExpr) -> Result<TensorDesc> {
        let stride = self.stride(dim)?.clone();

        let mut sizes = self.sizes.clone();
        let mut strides = self.strides.clone();
        sizes.remove(dim);
        strides.remove(dim);

        Ok(TensorDesc {
            name: self.name.clone(),
            dtype: self.dtype,
            sizes,
            strides,
            offset: self.offset.clone() + index * stride,
            source: self.source,
        })
    }

    /// Size variables needed to address the tensor.
    pub fn free_vars(&self) -> Vec<SizeVar> {
        let mut vars: Vec<SizeVar> = Vec::new();

        for expr in self
            .sizes
            .iter()
            .chain(self.strides.iter())
            .chain(core::iter::once(&self.offset))
        {
            for var in expr.free_vars() {
                if !vars.contains(&var) {
                    vars.push(var);
                }
            }
        }

        vars
    }

    fn out_of_range(&self, dim: usize) -> TemplateError {
        TemplateError::malformed(
            &self.name,
            format!("dimension {dim} out of range for rank {}", self.rank()),
        )
    }
}

/// Row-major strides of the given sizes.
pub fn contiguous_strides(sizes: &[SymExpr]) -> Vec<SymExpr> {
    let mut strides = vec![SymExpr::Const(1); sizes.len()];
    let mut current = SymExpr::Const(1);

    for (stride, size) in strides.iter_mut().zip(sizes.iter()).rev() {
        *stride = current.clone();
        current = current * size.clone();
    }

    strides
}
