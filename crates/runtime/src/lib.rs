//! bowl-runtime: the native ABI layer around bowl-core.
//!
//! Where `bowl-core` defines what a value is and how the collector
//! keeps it alive, this crate defines how a native function is called,
//! how a module is loaded and unloaded, how source text becomes
//! tokens, and the handful of process-wide settings the CLI entry
//! point reads once at startup.
//!
//! # Modules
//!
//! - `error`: the `Result<Handle, Handle>` discipline, exception
//!   construction, type assertions, stack-underflow naming.
//! - `module`: the dynamic module loader (`libc`'s `dlopen` family on
//!   Unix) and its GC-triggered finalize-on-unload integration.
//! - `tokenizer`: whitespace-splitting over `bowl_core::unicode`.
//! - `settings`: boot path, kernel path, verbosity.

pub mod error;
pub mod module;
pub mod settings;
pub mod tokenizer;

pub use module::{DynamicLibrary, ModuleRegistry};
