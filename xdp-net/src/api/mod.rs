pub mod error;
pub mod xsk;

pub use error::*;
