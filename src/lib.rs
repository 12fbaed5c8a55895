#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("hookfix only supports x86-64 targets");

pub mod alloc;
pub mod code;
pub mod config;
pub mod error;
pub mod fix;
pub mod freeze;
pub mod hook;
pub mod image;
pub mod logging;
pub mod patcher;
pub mod pattern;

pub use config::{Config, Settings};
pub use error::ErrorKind;
pub use fix::{Fix, FixReport, Orchestrator, Process, Target};
pub use hook::{install, Context, HookHandle};
pub use image::ModuleImage;
pub use patcher::write;
pub use pattern::{scan, BytePattern, MatchSet, ScanRegion};
