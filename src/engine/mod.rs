pub mod cache;
pub mod errors;
pub mod stream;

pub use errors::*;
