//! Native core of an embedded scripting runtime.
//!
//! - [`vm`]: the script engine (swc front end, tree-walking interpreter,
//!   persistent handles and external-memory accounting).
//! - [`runtime::wrap`]: the lifetime bridge between native resources and the
//!   script objects that expose them.
//! - [`runtime::r#async`]: the reactor loop and the worker pool for blocking
//!   operations.
//! - [`runtime`]: the execution context tying the above together.
//! - [`stdlib`] and [`bootstrap`]: the `node` bindings and the startup
//!   sequence that builds on them.

pub mod bootstrap;
pub mod config;
pub mod runtime;
pub mod stdlib;
pub mod vm;

pub use config::RuntimeConfig;
pub use runtime::{Fatal, Runtime};
