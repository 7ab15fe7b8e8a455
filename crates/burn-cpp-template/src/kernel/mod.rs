mod args;
mod base;
mod hooks;

pub use args::*;
pub use base::*;
pub use hooks::*;
