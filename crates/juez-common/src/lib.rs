//! Common types, errors, and utilities shared by the juez crates.

pub mod error;
pub mod signature;
pub mod types;

pub use error::{JudgeError, JudgeResult};
pub use signature::{FunctionSignature, Parameter, SignatureError};
pub use types::*;
