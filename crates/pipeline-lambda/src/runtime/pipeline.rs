//! Pipeline resolution and execution seams.
//!
//! The pipeline library is opaque to the dispatcher. It sees three traits:
//!
//! | Trait | Called | Fails with |
//! |-------|--------|------------|
//! | [`LoaderProvider`] | once, during cold start | `anyhow::Error` -> `ColdStartError` |
//! | [`PipelineLoader`] | per request | [`ResolveError`] |
//! | [`Pipeline`] | per request, on a blocking thread | [`ExecuteError`] |
//!
//! The default implementation reads JSON definitions from `pipelines/<id>.json`
//! along the search path and hands them to an [`Engine`].

use base64::Engine as _;
use bytes::Bytes;
use pipeline_lambda_sdk::event::validate_pipeline_id;
use pipeline_lambda_sdk::ipc::{EngineReply, EngineRequest};
use pipeline_lambda_sdk::{OutputFormat, PipelineOutput, PipelineTarget};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use super::search_path::SearchPath;
use crate::error::{ExecuteError, ResolveError};

/// Directory on the search path holding named definitions
pub const PIPELINES_DIR: &str = "pipelines";

const NODE_PROPERTIES: &[&str] = &["node", "attrs", "params", "evaluate", "plugin", "sources", "inputs"];

/// A resolved pipeline, ready to run
pub trait Pipeline: Send + Sync {
    /// Id or a short description of an inline definition
    fn name(&self) -> &str;

    /// Run to completion. Called on a blocking thread; `abort` fires when
    /// the dispatcher stops waiting for the result.
    fn execute(
        &self,
        params: &Map<String, Value>,
        format: OutputFormat,
        abort: &AbortHandle,
    ) -> Result<PipelineOutput, ExecuteError>;
}

/// Turns a request target into a pipeline
pub trait PipelineLoader: Send + Sync {
    fn resolve(&self, target: &PipelineTarget) -> Result<Arc<dyn Pipeline>, ResolveError>;
}

/// Produces the loader once the search path is known
pub trait LoaderProvider: Send + Sync {
    fn acquire(&self, search_path: &SearchPath) -> anyhow::Result<Arc<dyn PipelineLoader>>;
}

/// Executes validated definitions
pub trait Engine: Send + Sync {
    fn run(&self, request: &EngineRequest, abort: &AbortHandle) -> Result<EngineReply, ExecuteError>;
}

type AbortHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct AbortState {
    aborted: bool,
    hooks: Vec<AbortHook>,
}

/// Shared between a running execution and the task waiting on it. Work that
/// outlives the wait (an engine process) registers a hook to stop itself.
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<Mutex<AbortState>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AbortState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `hook` on abort, or right away if the handle already fired
    pub fn on_abort(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.aborted {
            drop(state);
            hook();
        } else {
            state.hooks.push(Box::new(hook));
        }
    }

    /// Fire every registered hook once
    pub fn abort(&self) {
        let hooks = {
            let mut state = self.state();
            state.aborted = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("AbortHandle")
            .field("aborted", &state.aborted)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

/// Where the output node's result is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    None,
    File,
    Ftp,
    S3,
    Image,
}

impl OutputMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "none" => Some(OutputMode::None),
            "file" => Some(OutputMode::File),
            "ftp" => Some(OutputMode::Ftp),
            "s3" => Some(OutputMode::S3),
            "image" => Some(OutputMode::Image),
            _ => None,
        }
    }
}

/// A pipeline definition that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    raw: Value,
    nodes: Vec<String>,
    output_node: String,
    output_mode: OutputMode,
}

impl PipelineDefinition {
    /// Validate a definition.
    ///
    /// Nodes are read in definition order; `sources` and `inputs` may only
    /// reference nodes defined before the referencing node.
    pub fn parse(raw: Value) -> Result<Self, ResolveError> {
        let nodes = match raw.get("nodes") {
            None => return Err(invalid("Pipeline definition requires 'nodes' property")),
            Some(Value::Object(nodes)) => nodes,
            Some(_) => return Err(invalid("Pipeline definition 'nodes' property must be an object")),
        };
        if nodes.is_empty() {
            return Err(invalid("Pipeline definition 'nodes' property cannot be empty"));
        }

        let mut defined: Vec<String> = Vec::with_capacity(nodes.len());
        for (name, node) in nodes {
            check_node(name, node, &defined)?;
            defined.push(name.clone());
        }

        let output = match raw.get("output") {
            None => Map::new(),
            Some(Value::Object(output)) => output.clone(),
            Some(_) => return Err(invalid("Pipeline 'output' property must be an object")),
        };

        let output_node = match output.get("node") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err(invalid("output definition 'node' must be a string")),
            None => defined.last().cloned().unwrap_or_default(),
        };
        if !nodes.contains_key(&output_node) {
            return Err(invalid(format!(
                "output definition references nonexistent node '{}'",
                output_node
            )));
        }

        let mode_name = output.get("mode").and_then(Value::as_str).unwrap_or("none");
        let output_mode = OutputMode::parse(mode_name)
            .ok_or_else(|| invalid(format!("output definition has unexpected mode '{}'", mode_name)))?;

        let definition = Self {
            raw,
            nodes: defined,
            output_node,
            output_mode,
        };
        for unused in definition.unused_nodes() {
            tracing::warn!(node = %unused, "Unused pipeline node");
        }
        Ok(definition)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Node names in definition order
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn output_node(&self) -> &str {
        &self.output_node
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Nodes the output node does not depend on
    pub fn unused_nodes(&self) -> Vec<&str> {
        let mut used = HashSet::new();
        let mut stack = vec![self.output_node.as_str()];
        while let Some(name) = stack.pop() {
            if !used.insert(name) {
                continue;
            }
            if let Some(node) = self.raw.get("nodes").and_then(|n| n.get(name)) {
                stack.extend(references(node));
            }
        }

        self.nodes
            .iter()
            .map(String::as_str)
            .filter(|name| !used.contains(name))
            .collect()
    }
}

fn check_node(name: &str, node: &Value, defined: &[String]) -> Result<(), ResolveError> {
    let Some(fields) = node.as_object() else {
        return Err(invalid(format!("node '{}' definition must be an object", name)));
    };

    match fields.get("node") {
        Some(Value::String(class)) if !class.is_empty() => {}
        _ => return Err(invalid(format!("node '{}' definition requires a 'node' class", name))),
    }

    if let Some(key) = fields.keys().find(|k| !NODE_PROPERTIES.contains(&k.as_str())) {
        return Err(invalid(format!(
            "node '{}' definition has unexpected property '{}'",
            name, key
        )));
    }

    match fields.get("sources") {
        None | Some(Value::Array(_)) => {}
        Some(_) => return Err(invalid(format!("node '{}' 'sources' must be a list", name))),
    }
    match fields.get("inputs") {
        None | Some(Value::Object(_)) => {}
        Some(_) => return Err(invalid(format!("node '{}' 'inputs' must be an object", name))),
    }

    for reference in references(node) {
        if !defined.iter().any(|d| d == reference) {
            return Err(invalid(format!(
                "node '{}' definition references nonexistent node '{}'",
                name, reference
            )));
        }
    }

    Ok(())
}

fn references(node: &Value) -> impl Iterator<Item = &str> {
    let sources = node
        .get("sources")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    let inputs = node
        .get("inputs")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|m| m.values());

    sources.chain(inputs).filter_map(Value::as_str)
}

fn invalid(message: impl Into<String>) -> ResolveError {
    ResolveError::Invalid(message.into())
}

/// Loads definitions from the search path or the event itself
pub struct DefinitionLoader {
    search_path: SearchPath,
    engine: Arc<dyn Engine>,
}

impl DefinitionLoader {
    pub fn new(search_path: SearchPath, engine: Arc<dyn Engine>) -> Self {
        Self { search_path, engine }
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    fn load_named(&self, id: &str) -> Result<PipelineDefinition, ResolveError> {
        validate_pipeline_id(id).map_err(|e| invalid(e.message))?;

        let rel = format!("{}/{}.json", PIPELINES_DIR, id);
        let path = self
            .search_path
            .find(&rel)
            .ok_or_else(|| ResolveError::UnknownPipeline(id.to_string()))?;

        let content = fs::read_to_string(&path).map_err(|source| ResolveError::Read {
            path: path.clone(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;

        tracing::debug!(pipeline = %id, path = %path.display(), "Loaded pipeline definition");
        PipelineDefinition::parse(raw)
    }
}

impl PipelineLoader for DefinitionLoader {
    fn resolve(&self, target: &PipelineTarget) -> Result<Arc<dyn Pipeline>, ResolveError> {
        let (name, definition) = match target {
            PipelineTarget::Named(id) => (id.clone(), self.load_named(id)?),
            PipelineTarget::Inline(raw) => ("inline".to_string(), PipelineDefinition::parse(raw.clone())?),
        };

        Ok(Arc::new(EnginePipeline {
            name,
            definition,
            engine: self.engine.clone(),
        }))
    }
}

/// A definition bound to the engine that runs it
pub struct EnginePipeline {
    name: String,
    definition: PipelineDefinition,
    engine: Arc<dyn Engine>,
}

impl fmt::Debug for EnginePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePipeline")
            .field("name", &self.name)
            .field("output_node", &self.definition.output_node)
            .finish()
    }
}

impl Pipeline for EnginePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        params: &Map<String, Value>,
        format: OutputFormat,
        abort: &AbortHandle,
    ) -> Result<PipelineOutput, ExecuteError> {
        let request = EngineRequest {
            definition: self.definition.raw().clone(),
            params: params.clone(),
            output_format: format,
        };

        match self.engine.run(&request, abort)? {
            EngineReply::Json { value } => Ok(PipelineOutput::Json(value)),
            EngineReply::Binary { data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| ExecuteError::InvalidOutput(format!("bad base64 payload: {}", e)))?;
                Ok(PipelineOutput::Binary(Bytes::from(bytes)))
            }
            EngineReply::Error { message } => Err(ExecuteError::Engine(message)),
        }
    }
}
