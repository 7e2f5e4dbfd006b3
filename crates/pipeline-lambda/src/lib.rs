//! pipeline-lambda: packages a pipeline library into size-bounded deployment
//! layers and dispatches invocations to it at run time.

pub mod build;
pub mod config;
pub mod error;
pub mod runtime;

pub use config::{AppConfig, Ceilings};
pub use error::{BuildError, CapacityLimit, ColdStartError, ExecuteError, ResolveError};
