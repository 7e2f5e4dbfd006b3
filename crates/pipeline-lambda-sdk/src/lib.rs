//! pipeline-lambda SDK - the invocation contract between the platform, the
//! dispatcher and the pipeline engine.
//!
//! Everything that crosses a process boundary lives here: incoming events,
//! invocation context, the response envelope, the error kinds callers can
//! tell apart, and the length-prefixed JSON framing used on stdin/stdout.

pub mod context;
pub mod error;
pub mod event;
pub mod ipc;
pub mod response;

pub mod prelude {
    //! Common imports for dispatcher and engine code
    pub use crate::context::{InvocationContext, RequestId};
    pub use crate::error::{ErrorKind, InvocationError};
    pub use crate::event::{OutputFormat, PipelineRequest, PipelineTarget};
    pub use crate::ipc::{read_frame, write_frame, EngineReply, EngineRequest, InvocationFrame};
    pub use crate::response::{InvocationFailure, InvocationReply, PipelineOutput, Response};
    pub use serde_json::{json, Value as JsonValue};
}

// Re-export key types at crate root
pub use context::{InvocationContext, RequestId};
pub use error::{ErrorKind, InvocationError, IpcError};
pub use event::{OutputFormat, PipelineRequest, PipelineTarget};
pub use response::{InvocationFailure, InvocationReply, PipelineOutput, Response};
