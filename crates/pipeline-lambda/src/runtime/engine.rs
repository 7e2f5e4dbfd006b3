//! Out-of-process pipeline engine.
//!
//! Each execution starts the engine executable, writes one [`EngineRequest`]
//! frame to its stdin and reads one [`EngineReply`] frame from its stdout.
//! The engine's stderr is passed through to ours. The process is always
//! reaped, and killed when the execution is aborted.

use anyhow::Context as _;
use pipeline_lambda_sdk::ipc::{read_frame, write_frame, EngineReply, EngineRequest};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::pipeline::{AbortHandle, DefinitionLoader, Engine, LoaderProvider, PipelineLoader};
use super::search_path::SearchPath;
use crate::error::ExecuteError;

/// Environment variable carrying the search path to the engine
pub const SEARCH_PATH_VAR: &str = "PIPELINE_LAMBDA_SEARCH_PATH";

/// Directory on the search path holding engine executables
pub const ENGINE_DIR: &str = "bin";

/// Runs the engine executable once per request
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    search_path: Option<OsString>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            search_path: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_search_path(mut self, search_path: &SearchPath) -> Self {
        self.search_path = search_path.to_env_value();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Engine for ProcessEngine {
    fn run(&self, request: &EngineRequest, abort: &AbortHandle) -> Result<EngineReply, ExecuteError> {
        let spawn_err = |source| ExecuteError::Spawn {
            path: self.program.clone(),
            source,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(search_path) = &self.search_path {
            command.env(SEARCH_PATH_VAR, search_path);
        }

        let mut child = command.spawn().map_err(spawn_err)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let process = EngineProcess::new(child);
        process.kill_on(abort);

        let mut stdin = stdin.ok_or_else(|| ExecuteError::Engine("engine stdin unavailable".into()))?;
        let mut stdout = stdout.ok_or_else(|| ExecuteError::Engine("engine stdout unavailable".into()))?;

        write_frame(&mut stdin, request)?;
        // end of input for the engine
        drop(stdin);

        let reply = read_frame::<_, EngineReply>(&mut stdout);
        let status = process.finish(EXIT_GRACE).map_err(spawn_err)?;

        if abort.is_aborted() {
            return Err(ExecuteError::Engine(format!("engine stopped after abort ({})", status)));
        }

        match reply? {
            Some(reply) => {
                tracing::debug!(engine = %self.program.display(), %status, "Engine replied");
                Ok(reply)
            }
            None => Err(ExecuteError::Engine(format!(
                "engine exited without a reply ({})",
                status
            ))),
        }
    }
}

/// How long an engine may take to exit after its reply or end of output
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A spawned engine. Dropping it kills the process if it is still running
/// and reaps it, so no exit path leaves a zombie behind.
struct EngineProcess {
    child: Arc<Mutex<Child>>,
}

impl EngineProcess {
    fn new(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(child)),
        }
    }

    fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
        child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Kill the process when `abort` fires
    fn kill_on(&self, abort: &AbortHandle) {
        let child = Arc::downgrade(&self.child);
        abort.on_abort(move || {
            if let Some(child) = child.upgrade() {
                let mut child = Self::lock(&child);
                tracing::warn!(pid = child.id(), "Killing engine process");
                let _ = child.kill();
            }
        });
    }

    /// Wait for the process to exit, killing it once `grace` has passed.
    /// The lock is released between polls so an abort can get through.
    fn finish(&self, grace: Duration) -> io::Result<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = Self::lock(&self.child).try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let mut child = Self::lock(&self.child);
                tracing::warn!(pid = child.id(), "Engine did not exit in time, killing it");
                let _ = child.kill();
                return child.wait();
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let mut child = Self::lock(&self.child);
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

/// Locates the engine at cold start and hands out a [`DefinitionLoader`]
#[derive(Debug, Clone)]
pub struct ProcessLoaderProvider {
    engine: String,
}

impl ProcessLoaderProvider {
    /// `engine` is an absolute path or a name looked up as `bin/<name>`
    pub fn new(engine: impl Into<String>) -> Self {
        Self { engine: engine.into() }
    }
}

impl LoaderProvider for ProcessLoaderProvider {
    fn acquire(&self, search_path: &SearchPath) -> anyhow::Result<Arc<dyn PipelineLoader>> {
        let program = locate_engine(&self.engine, search_path)
            .with_context(|| format!("Failed to locate pipeline engine '{}'", self.engine))?;

        tracing::info!(engine = %program.display(), "Pipeline engine located");
        let engine = ProcessEngine::new(program).with_search_path(search_path);
        Ok(Arc::new(DefinitionLoader::new(search_path.clone(), Arc::new(engine))))
    }
}

fn locate_engine(engine: &str, search_path: &SearchPath) -> anyhow::Result<PathBuf> {
    let path = Path::new(engine);
    if path.is_absolute() {
        if !path.is_file() {
            anyhow::bail!("{} is not a file", path.display());
        }
        return Ok(path.to_path_buf());
    }

    search_path
        .find(Path::new(ENGINE_DIR).join(engine))
        .filter(|p| p.is_file())
        .ok_or_else(|| anyhow::anyhow!("bin/{} not found in {} layer(s)", engine, search_path.len()))
}
