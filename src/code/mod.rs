//! # Code
//!
//! Machine-code generation for x86-64: jump encoders, instruction stealing and the mid-hook trampoline

pub mod stub;
pub mod x64;
