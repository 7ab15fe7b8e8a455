mod dtype;
mod expr;
mod rewrite;
mod tensor;

pub use dtype::*;
pub use expr::*;
pub use rewrite::*;
pub use tensor::*;
