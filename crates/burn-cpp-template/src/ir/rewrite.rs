use super::{SymExpr, TensorDesc};
use crate::error::{Result, TemplateError};
use ndarray::{ArrayD, IxDyn, Slice};
use num_traits::Zero;
use serde::Serialize;

/// A single step of a tensor rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TensorOp {
    /// Pad the last dimension on the right with zeros.
    PadLast { amount: usize },
    /// Reinterpret the row-major data with new sizes, a single `-1` is inferred.
    View { sizes: Vec<i64> },
    /// Reorder the dimensions.
    Permute { dims: Vec<usize> },
    /// Materialize the tensor in row-major order.
    Contiguous,
}

impl TensorOp {
    /// Descriptor of the result of the operation.
    pub fn apply_desc(&self, input: &TensorDesc) -> Result<TensorDesc> {
        match self {
            TensorOp::PadLast { amount } => {
                let mut sizes = input.sizes.clone();
                let last = sizes
                    .last_mut()
                    .ok_or_else(|| TemplateError::InvalidRewrite("cannot pad a scalar".into()))?;
                *last = last.clone() + SymExpr::from(*amount);

                Ok(TensorDesc::contiguous(
                    input.name.clone(),
                    input.dtype,
                    sizes,
                    input.source,
                ))
            }
            TensorOp::View { sizes } => {
                let sizes = infer_view_sizes(&input.sizes, sizes)?;

                Ok(TensorDesc::contiguous(
                    input.name.clone(),
                    input.dtype,
                    sizes,
                    input.source,
                ))
            }
            TensorOp::Permute { dims } => {
                check_permutation(dims, input.rank())?;

                let mut output = input.clone();
                output.sizes = dims.iter().map(|dim| input.sizes[*dim].clone()).collect();
                output.strides = dims.iter().map(|dim| input.strides[*dim].clone()).collect();
                Ok(output)
            }
            TensorOp::Contiguous => Ok(TensorDesc::contiguous(
                input.name.clone(),
                input.dtype,
                input.sizes.clone(),
                input.source,
            )),
        }
    }

    /// Evaluate the operation on actual data.
    pub fn apply<E: Clone + Zero>(&self, array: ArrayD<E>) -> Result<ArrayD<E>> {
        match self {
            TensorOp::PadLast { amount } => {
                if array.ndim() == 0 {
                    return Err(TemplateError::InvalidRewrite("cannot pad a scalar".into()));
                }
                let last = array.ndim() - 1;
                let width = array.shape()[last];

                let mut shape = array.shape().to_vec();
                shape[last] += amount;

                let mut padded = ArrayD::<E>::zeros(IxDyn(&shape));
                padded
                    .slice_each_axis_mut(|axis| {
                        if axis.axis.index() == last {
                            Slice::from(0..width)
                        } else {
                            Slice::from(..)
                        }
                    })
                    .assign(&array);

                Ok(padded)
            }
            TensorOp::View { sizes } => {
                let shape = infer_view_shape(array.shape(), sizes)?;
                let array = array.as_standard_layout().into_owned();

                Ok(array.into_shape_with_order(IxDyn(&shape))?)
            }
            TensorOp::Permute { dims } => {
                check_permutation(dims, array.ndim())?;
                Ok(array.permuted_axes(IxDyn(dims)))
            }
            TensorOp::Contiguous => Ok(array.as_standard_layout().into_owned()),
        }
    }
}

/// A sequence of operations turning one tensor into another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorRewrite {
    pub input: TensorDesc,
    pub ops: Vec<TensorOp>,
    pub output: TensorDesc,
}

impl TensorRewrite {
    /// The rewrite that leaves the tensor untouched.
    pub fn identity(input: TensorDesc) -> Self {
        Self {
            output: input.clone(),
            input,
            ops: Vec::new(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append an operation, updating the output descriptor.
    pub fn then(mut self, op: TensorOp) -> Result<Self> {
        self.output = op.apply_desc(&self.output)?;
        self.ops.push(op);
        Ok(self)
    }

    /// Evaluate all the operations on actual data.
    pub fn apply<E: Clone + Zero>(&self, array: ArrayD<E>) -> Result<ArrayD<E>> {
        self.ops.iter().try_fold(array, |array, op| op.apply(array))
    }
}

fn check_permutation(dims: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];

    if dims.len() != rank {
        return Err(TemplateError::InvalidRewrite(format!(
            "permutation {dims:?} does not match rank {rank}"
        )));
    }

    for dim in dims {
        match seen.get_mut(*dim) {
            Some(seen) if !*seen => *seen = true,
            _ => {
                return Err(TemplateError::InvalidRewrite(format!(
                    "invalid permutation {dims:?}"
                )))
            }
        }
    }

    Ok(())
}

fn inferred_position(sizes: &[i64]) -> Result<Option<usize>> {
    let mut position = None;

    for (i, size) in sizes.iter().enumerate() {
        match *size {
            -1 if position.is_none() => position = Some(i),
            -1 => {
                return Err(TemplateError::InvalidRewrite(format!(
                    "view {sizes:?} infers more than one dimension"
                )))
            }
            size if size < 0 => {
                return Err(TemplateError::InvalidRewrite(format!(
                    "view {sizes:?} has a negative dimension"
                )))
            }
            _ => {}
        }
    }

    Ok(position)
}

fn infer_view_shape(shape: &[usize], sizes: &[i64]) -> Result<Vec<usize>> {
    let numel: usize = shape.iter().product();
    let known: usize = sizes.iter().filter(|size| **size >= 0).map(|size| *size as usize).product();
    let mut output: Vec<usize> = sizes.iter().map(|size| (*size).max(0) as usize).collect();

    if let Some(position) = inferred_position(sizes)? {
        if known == 0 || numel % known != 0 {
            return Err(TemplateError::InvalidRewrite(format!(
                "cannot view {shape:?} as {sizes:?}"
            )));
        }
        output[position] = numel / known;
    }

    if output.iter().product::<usize>() != numel {
        return Err(TemplateError::InvalidRewrite(format!(
            "cannot view {shape:?} as {sizes:?}"
        )));
    }

    Ok(output)
}

fn infer_view_sizes(input: &[SymExpr], sizes: &[i64]) -> Result<Vec<SymExpr>> {
    let (numel_const, numel_symbols) = SymExpr::product(input).factors();
    let known: i64 = sizes.iter().filter(|size| **size >= 0).product();
    let mut output: Vec<SymExpr> = sizes.iter().map(|size| SymExpr::Const(*size)).collect();
    let mismatch = || TemplateError::InvalidRewrite(format!("cannot view {input:?} as {sizes:?}"));

    match inferred_position(sizes)? {
        Some(position) => {
            if known == 0 || numel_const % known != 0 {
                return Err(mismatch());
            }
            output[position] = numel_symbols
                .iter()
                .fold(SymExpr::Const(numel_const / known), |acc, factor| {
                    acc * factor.clone()
                });
        }
        None => {
            if !numel_symbols.is_empty() || numel_const != known {
                return Err(mismatch());
            }
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DType, SizeVar, TensorSource};
    use ndarray::Array;

    fn weight(dims: &[usize]) -> TensorDesc {
        TensorDesc::contiguous(
            "arg1_1",
            DType::F32,
            dims.iter().map(|dim| SymExpr::from(*dim)).collect(),
            TensorSource::Computed,
        )
    }

    #[test]
    fn pad_last_fills_with_zeros() {
        let array = Array::from_shape_vec(IxDyn(&[2, 3]), vec![1., 2., 3., 4., 5., 6.]).unwrap();

        let padded = TensorOp::PadLast { amount: 2 }.apply(array).unwrap();

        assert_eq!(padded.shape(), &[2, 5]);
        assert_eq!(
            padded.iter().copied().collect::<Vec<f32>>(),
            vec![1., 2., 3., 0., 0., 4., 5., 6., 0., 0.]
        );
    }

    #[test]
    fn view_infers_symbolic_batch() {
        let batch = SizeVar::new("s0");
        let input = TensorDesc::contiguous(
            "arg1_1",
            DType::F32,
            vec![SymExpr::from(&batch), SymExpr::Const(8), SymExpr::Const(32)],
            TensorSource::Computed,
        );

        let output = TensorOp::View {
            sizes: vec![-1, 8, 2, 16],
        }
        .apply_desc(&input)
        .unwrap();

        assert_eq!(output.sizes[0], SymExpr::Var(batch));
        assert_eq!(output.strides[0].to_string(), "256");
    }

    #[test]
    fn view_rejects_mismatching_sizes() {
        let op = TensorOp::View {
            sizes: vec![-1, 3, 16],
        };
        assert!(op.apply_desc(&weight(&[2, 8, 32])).is_err());
        assert!(op.apply(ArrayD::<f32>::zeros(IxDyn(&[2, 8, 32]))).is_err());
    }

    #[test]
    fn permute_reorders_sizes_and_strides() {
        let output = TensorOp::Permute {
            dims: vec![0, 2, 1],
        }
        .apply_desc(&weight(&[2, 8, 4]))
        .unwrap();

        assert_eq!(output.sizes, vec![SymExpr::Const(2), SymExpr::Const(4), SymExpr::Const(8)]);
        assert_eq!(output.strides, vec![SymExpr::Const(32), SymExpr::Const(1), SymExpr::Const(4)]);
        assert!(!output.is_contiguous());
    }

    #[test]
    fn invalid_permutation_is_rejected() {
        let op = TensorOp::Permute {
            dims: vec![0, 0, 1],
        };
        assert!(matches!(
            op.apply_desc(&weight(&[2, 8, 4])),
            Err(TemplateError::InvalidRewrite(_))
        ));
    }

    #[test]
    fn rewrite_tracks_output_descriptor() {
        let rewrite = TensorRewrite::identity(weight(&[2, 8, 30]))
            .then(TensorOp::PadLast { amount: 2 })
            .unwrap()
            .then(TensorOp::View {
                sizes: vec![-1, 8, 2, 16],
            })
            .unwrap();

        assert_eq!(rewrite.ops.len(), 2);
        assert_eq!(
            rewrite.output.sizes,
            vec![
                SymExpr::Const(2),
                SymExpr::Const(8),
                SymExpr::Const(2),
                SymExpr::Const(16)
            ]
        );
        assert_eq!(rewrite.input.sizes[2], SymExpr::Const(30));
    }
}
