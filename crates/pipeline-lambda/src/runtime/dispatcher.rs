//! Per-invocation dispatch.
//!
//! Every event goes through the same steps: ensure Warm, parse the event,
//! resolve the pipeline, execute it on a blocking thread under a timeout,
//! wrap the output in a response envelope. Cold-start failures are returned
//! as errors so the platform sees a failed invocation; resolution and
//! execution failures become error envelopes.

use pipeline_lambda_sdk::{InvocationContext, InvocationError, OutputFormat, PipelineOutput, PipelineRequest, Response};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::bootstrap::{Bootstrap, LayerSource, Warm};
use super::engine::ProcessLoaderProvider;
use super::pipeline::{AbortHandle, Pipeline};
use crate::config::AppConfig;
use crate::error::ExecuteError;

/// Default pipeline execution timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes events to pipelines
pub struct Dispatcher {
    bootstrap: Bootstrap,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(bootstrap: Bootstrap) -> Self {
        Self {
            bootstrap,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Layers and engine from configuration
    pub fn from_config(config: &AppConfig) -> Self {
        let mut bootstrap = Bootstrap::new(
            LayerSource::from_config(config),
            Arc::new(ProcessLoaderProvider::new(config.engine.clone())),
        );
        if let Some(secs) = config.cold_start_timeout_secs {
            bootstrap = bootstrap.with_cold_start_timeout(Duration::from_secs(secs));
        }
        Self::new(bootstrap).with_timeout(Duration::from_secs(config.timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Handle one invocation
    pub async fn handle(&self, event: Value, ctx: InvocationContext) -> Result<Response, InvocationError> {
        let span = tracing::info_span!("invoke", request_id = %ctx.request_id);

        async move {
            let warm = self.bootstrap.ensure_warm().await?;

            match self.dispatch(warm, &event, &ctx).await {
                Ok(response) => {
                    tracing::info!(status = response.status_code, "Invocation complete");
                    Ok(response)
                }
                Err(err) => {
                    tracing::warn!(kind = %err.kind, error = %err.message, "Invocation failed");
                    Ok(Response::error(&err))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, warm: &Warm, event: &Value, ctx: &InvocationContext) -> Result<Response, InvocationError> {
        let request = PipelineRequest::from_event(event)?;
        tracing::debug!(target_pipeline = %request.target, format = request.output_format.as_str(), "Resolving pipeline");

        let pipeline = warm.loader().resolve(&request.target)?;

        let timeout = match ctx.time_remaining() {
            Some(remaining) => remaining.min(self.timeout),
            None => self.timeout,
        };

        let output = execute_with_timeout(pipeline, request.params, request.output_format, timeout).await?;
        Ok(Response::from_output(output, request.output_format))
    }
}

/// Run a pipeline on the blocking pool, bounded by `timeout`. On timeout the
/// pipeline's abort handle fires so its engine process is stopped.
pub async fn execute_with_timeout(
    pipeline: Arc<dyn Pipeline>,
    params: Map<String, Value>,
    format: OutputFormat,
    timeout: Duration,
) -> Result<PipelineOutput, ExecuteError> {
    let name = pipeline.name().to_string();
    let abort = AbortHandle::new();

    // Wrap sync execution in spawn_blocking for timeout support
    let future = {
        let abort = abort.clone();
        tokio::task::spawn_blocking(move || pipeline.execute(&params, format, &abort))
    };

    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ExecuteError::Panicked(format!("pipeline '{}': {}", name, e))),
        Err(_) => {
            tracing::warn!(pipeline = %name, ?timeout, "Execution timed out, aborting");
            abort.abort();
            Err(ExecuteError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use crate::runtime::pipeline::{LoaderProvider, PipelineLoader};
    use crate::runtime::search_path::SearchPath;
    use pipeline_lambda_sdk::{ErrorKind, PipelineTarget};
    use serde_json::json;
    use std::fs;

    /// Echoes its params, or misbehaves on request
    struct Echo;

    impl Pipeline for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute(
            &self,
            params: &Map<String, Value>,
            format: OutputFormat,
            _abort: &AbortHandle,
        ) -> Result<PipelineOutput, ExecuteError> {
            match params.get("mode").and_then(Value::as_str) {
                Some("fail") => Err(ExecuteError::Engine("division by zero in node 'ndvi'".into())),
                Some("panic") => panic!("engine crashed"),
                Some("slow") => {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(PipelineOutput::Json(Value::Null))
                }
                _ if format.is_binary() => Ok(PipelineOutput::Binary(bytes::Bytes::from_static(b"\x89PNG"))),
                _ => Ok(PipelineOutput::Json(Value::Object(params.clone()))),
            }
        }
    }

    struct EchoLoader;

    impl PipelineLoader for EchoLoader {
        fn resolve(&self, target: &PipelineTarget) -> Result<Arc<dyn Pipeline>, ResolveError> {
            match target {
                PipelineTarget::Named(id) if id == "echo" => Ok(Arc::new(Echo)),
                other => Err(ResolveError::UnknownPipeline(other.to_string())),
            }
        }
    }

    struct EchoProvider;

    impl LoaderProvider for EchoProvider {
        fn acquire(&self, _search_path: &SearchPath) -> anyhow::Result<Arc<dyn PipelineLoader>> {
            Ok(Arc::new(EchoLoader))
        }
    }

    fn dispatcher(root: &std::path::Path) -> Dispatcher {
        fs::create_dir_all(root.join("layer-0")).unwrap();
        Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(root.to_path_buf()),
            Arc::new(EchoProvider),
        ))
        .with_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(tmp.path());

        let response = dispatcher
            .handle(json!({"pipeline": "echo", "params": {"x": 1}}), InvocationContext::default())
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success());
        assert_eq!(response.body_json(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_binary_output_is_base64() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(tmp.path());

        let response = dispatcher
            .handle(json!({"pipeline": "echo", "output_format": "png"}), InvocationContext::default())
            .await
            .unwrap();

        assert!(response.is_base64_encoded);
        assert_eq!(response.header("content-type").map(String::as_str), Some("image/png"));
        assert_eq!(response.body_bytes(), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(tmp.path());

        let response = dispatcher
            .handle(json!({"pipeline": "smap"}), InvocationContext::default())
            .await
            .unwrap();

        assert_eq!(response.status_code, 400);
        assert_eq!(response.error_kind(), Some(ErrorKind::ResolutionError));
        assert!(!response.is_success());
        let body = response.body_json().unwrap();
        assert!(body["error"]["message"].as_str().unwrap().contains("smap"));
        assert!(body.get("output").is_none());
    }

    #[tokio::test]
    async fn test_malformed_event_is_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(tmp.path());

        let response = dispatcher.handle(json!([1, 2]), InvocationContext::default()).await.unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::ResolutionError));
    }

    #[tokio::test]
    async fn test_execution_failures_are_execution_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(tmp.path());

        for mode in ["fail", "panic", "slow"] {
            let response = dispatcher
                .handle(
                    json!({"pipeline": "echo", "params": {"mode": mode}}),
                    InvocationContext::default(),
                )
                .await
                .unwrap();

            assert_eq!(response.status_code, 500, "mode {}", mode);
            assert_eq!(response.error_kind(), Some(ErrorKind::ExecutionError));
        }
    }

    #[tokio::test]
    async fn test_cold_start_failure_is_surfaced_and_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(tmp.path().to_path_buf()),
            Arc::new(EchoProvider),
        ));

        let err = dispatcher
            .handle(json!({"pipeline": "echo"}), InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ColdStartError);
        assert!(!dispatcher.bootstrap().is_warm());

        fs::create_dir(tmp.path().join("layer-0")).unwrap();
        let response = dispatcher
            .handle(json!({"pipeline": "echo"}), InvocationContext::default())
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(dispatcher.bootstrap().is_warm());
    }

    /// Blocks until aborted, recording that the abort arrived
    struct Stuck {
        aborted: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Pipeline for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn execute(
            &self,
            _params: &Map<String, Value>,
            _format: OutputFormat,
            abort: &AbortHandle,
        ) -> Result<PipelineOutput, ExecuteError> {
            let (tx, rx) = std::sync::mpsc::channel();
            abort.on_abort(move || {
                let _ = tx.send(());
            });
            let stopped = rx.recv_timeout(Duration::from_secs(5)).is_ok();
            self.aborted.store(stopped, std::sync::atomic::Ordering::SeqCst);
            Err(ExecuteError::Engine("stopped".into()))
        }
    }

    #[tokio::test]
    async fn test_timeout_aborts_the_execution() {
        let aborted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pipeline = Arc::new(Stuck { aborted: aborted.clone() });

        let err = execute_with_timeout(pipeline, Map::new(), OutputFormat::Json, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout(_)));

        // the blocking thread wakes up from the abort, well before its own limit
        for _ in 0..100 {
            if aborted.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(aborted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_from_config_applies_cold_start_timeout() {
        let mut config = AppConfig::from_env();
        config.cold_start_timeout_secs = Some(7);
        let dispatcher = Dispatcher::from_config(&config);
        assert_eq!(dispatcher.bootstrap().cold_start_timeout(), Some(Duration::from_secs(7)));

        config.cold_start_timeout_secs = None;
        assert_eq!(Dispatcher::from_config(&config).bootstrap().cold_start_timeout(), None);
    }
}
