mod epilogue;
mod micro;
mod template;

pub use epilogue::*;
pub use micro::*;
pub use template::*;
