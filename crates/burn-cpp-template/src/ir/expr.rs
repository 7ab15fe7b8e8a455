use core::fmt::Display;
use core::ops::{Add, Mul};
use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

static NEXT_SIZE_VAR_ID: AtomicU64 = AtomicU64::new(0);

/// A non-negative integer symbol used in sizes, strides and offsets of generated code.
///
/// Each call to [SizeVar::new] creates a distinct symbol, even when two symbols share the same
/// name. The name is what ends up in the generated code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SizeVar {
    name: String,
    id: u64,
}

impl SizeVar {
    /// Create a fresh symbol.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            id: NEXT_SIZE_VAR_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process unique identifier of the symbol.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Display for SizeVar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for SizeVar {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

/// Symbolic integer expression rendered into C++.
///
/// Constructing sums and products through the `+` and `*` operators folds constants, so shapes
/// that are fully known stay plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymExpr {
    Const(i64),
    /// A size variable, passed to the kernel as an argument.
    Var(SizeVar),
    /// A loop index of the generated code, never a kernel argument.
    Index(String),
    Add(Box<SymExpr>, Box<SymExpr>),
    Mul(Box<SymExpr>, Box<SymExpr>),
}

impl SymExpr {
    pub fn index<S: Into<String>>(name: S) -> Self {
        Self::Index(name.into())
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            SymExpr::Const(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_const() == Some(0)
    }

    /// Product of all the expressions, `1` when empty.
    pub fn product<'a, I: IntoIterator<Item = &'a SymExpr>>(items: I) -> SymExpr {
        items
            .into_iter()
            .fold(SymExpr::Const(1), |acc, item| acc * item.clone())
    }

    /// Size variables referenced by the expression, in order of first appearance.
    pub fn free_vars(&self) -> Vec<SizeVar> {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        vars
    }

    fn collect_vars(&self, vars: &mut Vec<SizeVar>) {
        match self {
            SymExpr::Var(var) => {
                if !vars.contains(var) {
                    vars.push(var.clone());
                }
            }
            SymExpr::Add(lhs, rhs) | SymExpr::Mul(lhs, rhs) => {
                lhs.collect_vars(vars);
                rhs.collect_vars(vars);
            }
            SymExpr::Const(_) | SymExpr::Index(_) => {}
        }
    }

    /// Split a product into its constant factor and its symbolic factors.
    pub(crate) fn factors(&self) -> (i64, Vec<SymExpr>) {
        match self {
            SymExpr::Const(value) => (*value, Vec::new()),
            SymExpr::Mul(lhs, rhs) => {
                let (c_lhs, mut f_lhs) = lhs.factors();
                let (c_rhs, f_rhs) = rhs.factors();
                f_lhs.extend(f_rhs);
                (c_lhs * c_rhs, f_lhs)
            }
            other => (1, vec![other.clone()]),
        }
    }
}

impl Add for SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: SymExpr) -> SymExpr {
        match (self, rhs) {
            (SymExpr::Const(lhs), SymExpr::Const(rhs)) => SymExpr::Const(lhs + rhs),
            (SymExpr::Const(0), expr) | (expr, SymExpr::Const(0)) => expr,
            // Constants go last: `s0*16 + 4` reads better than `4 + s0*16`.
            (lhs @ SymExpr::Const(_), rhs) => SymExpr::Add(Box::new(rhs), Box::new(lhs)),
            (lhs, rhs) => SymExpr::Add(Box::new(lhs), Box::new(rhs)),
        }
    }
}

impl Mul for SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: SymExpr) -> SymExpr {
        match (self, rhs) {
            (SymExpr::Const(lhs), SymExpr::Const(rhs)) => SymExpr::Const(lhs * rhs),
            (SymExpr::Const(0), _) | (_, SymExpr::Const(0)) => SymExpr::Const(0),
            (SymExpr::Const(1), expr) | (expr, SymExpr::Const(1)) => expr,
            (SymExpr::Const(value), expr) => expr * SymExpr::Const(value),
            (SymExpr::Mul(expr, factor), SymExpr::Const(value)) => match *factor {
                SymExpr::Const(previous) => *expr * SymExpr::Const(previous * value),
                factor => SymExpr::Mul(
                    Box::new(SymExpr::Mul(expr, Box::new(factor))),
                    Box::new(SymExpr::Const(value)),
                ),
            },
            (lhs, rhs) => SymExpr::Mul(Box::new(lhs), Box::new(rhs)),
        }
    }
}

impl From<i64> for SymExpr {
    fn from(value: i64) -> Self {
        SymExpr::Const(value)
    }
}

impl From<usize> for SymExpr {
    fn from(value: usize) -> Self {
        SymExpr::Const(value as i64)
    }
}

impl From<SizeVar> for SymExpr {
    fn from(var: SizeVar) -> Self {
        SymExpr::Var(var)
    }
}

impl From<&SizeVar> for SymExpr {
    fn from(var: &SizeVar) -> Self {
        SymExpr::Var(var.clone())
    }
}

impl Display for SymExpr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SymExpr::Const(value) => write!(f, "{value}"),
            SymExpr::Var(var) => write!(f, "{var}"),
            SymExpr::Index(name) => f.write_str(name),
            SymExpr::Add(lhs, rhs) => write!(f, "{lhs} + {rhs}"),
            SymExpr::Mul(lhs, rhs) => {
                write_factor(f, lhs)?;
                f.write_str("*")?;
                write_factor(f, rhs)
            }
        }
    }
}

fn write_factor(f: &mut core::fmt::Formatter<'_>, expr: &SymExpr) -> core::fmt::Result {
    match expr {
        SymExpr::Add(..) => write!(f, "({expr})"),
        SymExpr::Const(value) if *value < 0 => write!(f, "({value})"),
        _ => write!(f, "{expr}"),
    }
}

impl Serialize for SymExpr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_folded() {
        let expr = SymExpr::from(4usize) * SymExpr::from(8usize) + SymExpr::from(2usize);
        assert_eq!(expr, SymExpr::Const(34));
    }

    #[test]
    fn neutral_terms_are_dropped() {
        let var = SizeVar::new("s0");
        let expr = SymExpr::from(&var) * SymExpr::Const(1) + SymExpr::Const(0);
        assert_eq!(expr, SymExpr::Var(var.clone()));
        assert!((SymExpr::from(&var) * SymExpr::Const(0)).is_zero());
    }

    #[test]
    fn constant_factors_are_merged_and_rendered_last() {
        let var = SizeVar::new("s_b_index");
        let expr = SymExpr::Const(16) * (SymExpr::from(&var) * SymExpr::Const(64));
        assert_eq!(expr.to_string(), "s_b_index*1024");
    }

    #[test]
    fn sums_are_parenthesized_inside_products() {
        let var = SizeVar::new("s0");
        let expr = (SymExpr::from(&var) + SymExpr::Const(1)) * SymExpr::index("m");
        assert_eq!(expr.to_string(), "(s0 + 1)*m");
    }

    #[test]
    fn free_vars_skip_loop_indices() {
        let batch = SizeVar::new("s0");
        let expr = SymExpr::from(&batch) * SymExpr::index("m") + SymExpr::from(&batch);
        assert_eq!(expr.free_vars(), vec![batch]);
    }

    #[test]
    fn size_vars_with_same_name_are_distinct() {
        let lhs = SizeVar::new("s_b_index");
        let rhs = SizeVar::new("s_b_index");
        assert_ne!(lhs, rhs);
        assert_eq!(lhs.name(), rhs.name());
    }

    #[test]
    fn factors_split_products() {
        let var = SizeVar::new("s0");
        let expr = SymExpr::from(&var) * SymExpr::Const(12);
        let (constant, symbols) = expr.factors();
        assert_eq!(constant, 12);
        assert_eq!(symbols, vec![SymExpr::Var(var)]);
    }
}
