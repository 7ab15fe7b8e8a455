mod call;
mod dispatch;
mod epilogue;
mod template;
mod weight;

pub use call::*;
pub use dispatch::*;
pub use epilogue::*;
pub use template::*;
pub use weight::*;
