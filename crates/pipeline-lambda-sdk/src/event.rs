//! Incoming invocation events

use crate::error::InvocationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Raw event as delivered by the platform.
///
/// Events arrive either directly (`{"pipeline": "ndvi", "params": {...}}`),
/// wrapped by an HTTP proxy (`{"body": "<json>"}`), or as query string
/// parameters (`{"queryStringParameters": {"pipeline": "ndvi"}}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Identifier of a pipeline definition deployed with the layers
    #[serde(default)]
    pub pipeline: Option<String>,

    /// Inline pipeline definition
    #[serde(default)]
    pub definition: Option<Value>,

    /// Parameters passed to the pipeline
    #[serde(default)]
    pub params: Option<Value>,

    /// Output format hint (json, png, geotiff, netcdf)
    #[serde(default, alias = "outputFormat", alias = "format")]
    pub output_format: Option<String>,

    /// HTTP proxy body (a JSON document encoding another event)
    #[serde(default)]
    pub body: Option<String>,

    /// HTTP proxy query string
    #[serde(default, rename = "queryStringParameters")]
    pub query: Option<HashMap<String, String>>,
}

/// What to run
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineTarget {
    /// A definition found by identifier on the search path
    Named(String),
    /// A definition shipped inside the event
    Inline(Value),
}

impl fmt::Display for PipelineTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineTarget::Named(id) => write!(f, "{}", id),
            PipelineTarget::Inline(_) => f.write_str("<inline>"),
        }
    }
}

/// Requested output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Png,
    Geotiff,
    Netcdf,
}

impl OutputFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "png" => Some(OutputFormat::Png),
            "geotiff" | "tif" | "tiff" => Some(OutputFormat::Geotiff),
            "netcdf" | "nc" => Some(OutputFormat::Netcdf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Png => "png",
            OutputFormat::Geotiff => "geotiff",
            OutputFormat::Netcdf => "netcdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Png => "image/png",
            OutputFormat::Geotiff => "image/tiff",
            OutputFormat::Netcdf => "application/x-netcdf",
        }
    }

    pub fn is_binary(&self) -> bool {
        !matches!(self, OutputFormat::Json)
    }
}

/// A parsed, validated request: pipeline target, parameters, output format.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub target: PipelineTarget,
    pub params: Map<String, Value>,
    pub output_format: OutputFormat,
}

impl PipelineRequest {
    /// Parse an incoming event.
    ///
    /// Every failure here is the caller's fault and is reported as a
    /// `ResolutionError`.
    pub fn from_event(value: &Value) -> Result<Self, InvocationError> {
        if !value.is_object() {
            return Err(InvocationError::resolution("Event must be a JSON object"));
        }

        let event: Event = serde_json::from_value(value.clone())
            .map_err(|e| InvocationError::resolution(format!("Malformed event: {}", e)))?;

        Self::from_parsed(event, true)
    }

    fn from_parsed(mut event: Event, allow_body: bool) -> Result<Self, InvocationError> {
        if event.pipeline.is_none() && event.definition.is_none() {
            if let Some(body) = event.body.take() {
                if !allow_body {
                    return Err(InvocationError::resolution("Nested event bodies are not supported"));
                }
                let mut inner: Event = serde_json::from_str(&body)
                    .map_err(|e| InvocationError::resolution(format!("Invalid JSON body: {}", e)))?;
                if inner.query.is_none() {
                    inner.query = event.query.take();
                }
                return Self::from_parsed(inner, false);
            }
        }

        let mut params = match event.params.take() {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(InvocationError::resolution("'params' must be a JSON object")),
        };

        let mut output_format = event.output_format.take();

        if let Some(query) = event.query.take() {
            for (key, value) in query {
                match key.as_str() {
                    "pipeline" if event.pipeline.is_none() => event.pipeline = Some(value),
                    "format" | "output_format" if output_format.is_none() => output_format = Some(value),
                    _ => {
                        params.entry(key).or_insert(Value::String(value));
                    }
                }
            }
        }

        let target = match (event.pipeline, event.definition) {
            (Some(_), Some(_)) => {
                return Err(InvocationError::resolution(
                    "Event names both 'pipeline' and 'definition'",
                ))
            }
            (Some(id), None) => {
                validate_pipeline_id(&id)?;
                PipelineTarget::Named(id)
            }
            (None, Some(definition)) => PipelineTarget::Inline(definition),
            (None, None) => {
                return Err(InvocationError::resolution(
                    "Event must name a 'pipeline' or carry a 'definition'",
                ))
            }
        };

        let output_format = match output_format {
            None => OutputFormat::default(),
            Some(name) => OutputFormat::parse(&name).ok_or_else(|| {
                InvocationError::resolution(format!("Unsupported output format '{}'", name))
            })?,
        };

        Ok(Self {
            target,
            params,
            output_format,
        })
    }
}

/// Pipeline identifiers become file names on the search path, so only a
/// conservative character set is accepted.
pub fn validate_pipeline_id(id: &str) -> Result<(), InvocationError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(InvocationError::resolution(format!("Invalid pipeline identifier '{}'", id)))
    }
}
