//! Runtime module - cold start and per-invocation dispatch
//!
//! - Layer discovery and the ordered search path
//! - Cold -> Warm state machine guarding process-wide initialization
//! - Pipeline resolution and the out-of-process engine
//! - Dispatch with timeouts, and the frame-based serve loop

pub mod bootstrap;
pub mod dispatcher;
pub mod engine;
pub mod pipeline;
pub mod search_path;
pub mod serve;

pub use bootstrap::{Bootstrap, LayerSource, Warm};
pub use dispatcher::Dispatcher;
pub use engine::{ProcessEngine, ProcessLoaderProvider};
pub use pipeline::{
    AbortHandle, DefinitionLoader, Engine, LoaderProvider, Pipeline, PipelineDefinition, PipelineLoader,
};
pub use search_path::SearchPath;
pub use serve::serve;
