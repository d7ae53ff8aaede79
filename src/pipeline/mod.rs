pub mod engine;
pub mod fetch;

pub use engine::*;
pub use fetch::*;
