//! Invocation loop over length-prefixed JSON frames.
//!
//! The platform shim writes one [`InvocationFrame`] per event and reads one
//! [`InvocationReply`] back. Frames are read on a dedicated thread so the
//! async runtime never blocks on the input stream.

use anyhow::{Context, Result};
use pipeline_lambda_sdk::ipc::{read_frame, write_frame, InvocationFrame};
use pipeline_lambda_sdk::{InvocationError, InvocationReply, IpcError, Response};
use std::io::{Read, Write};
use tokio::sync::mpsc;

use super::dispatcher::Dispatcher;

/// Serve invocations until the input stream ends. Returns the number of
/// invocations answered.
pub async fn serve<R, W>(dispatcher: &Dispatcher, reader: R, mut writer: W) -> Result<u64>
where
    R: Read + Send + 'static,
    W: Write,
{
    let (tx, mut rx) = mpsc::channel::<Result<InvocationFrame, IpcError>>(1);

    let reader_thread = std::thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || read_loop(reader, tx))
        .context("Failed to start frame reader")?;

    let mut answered = 0u64;
    while let Some(frame) = rx.recv().await {
        let reply = match frame {
            Ok(frame) => InvocationReply::from(dispatcher.handle(frame.event, frame.context).await),
            // the payload was consumed, so the stream is still in sync
            Err(IpcError::Serialization(e)) => InvocationReply::Response(Response::error(
                &InvocationError::resolution(format!("Malformed invocation frame: {}", e)),
            )),
            Err(e) => return Err(e).context("Failed to read invocation frame"),
        };

        match write_frame(&mut writer, &reply) {
            Ok(()) => {}
            Err(IpcError::FrameTooLarge { size, limit }) => {
                let err = InvocationError::execution(format!(
                    "Response of {} bytes exceeds the {} byte payload limit",
                    size, limit
                ));
                write_frame(&mut writer, &InvocationReply::Response(Response::error(&err)))
                    .context("Failed to write reply")?;
            }
            Err(e) => return Err(e).context("Failed to write reply"),
        }
        answered += 1;
    }

    if reader_thread.join().is_err() {
        anyhow::bail!("Frame reader thread panicked");
    }

    tracing::info!(answered, "Input closed, serve loop exiting");
    Ok(answered)
}

fn read_loop<R: Read>(mut reader: R, tx: mpsc::Sender<Result<InvocationFrame, IpcError>>) {
    loop {
        let item = match read_frame::<_, InvocationFrame>(&mut reader) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        let fatal = matches!(item, Err(ref e) if !matches!(e, IpcError::Serialization(_)));

        if tx.blocking_send(item).is_err() || fatal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bootstrap::{Bootstrap, LayerSource};
    use crate::runtime::pipeline::{LoaderProvider, PipelineLoader};
    use crate::runtime::search_path::SearchPath;
    use pipeline_lambda_sdk::ErrorKind;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;

    struct NoLoader;

    impl LoaderProvider for NoLoader {
        fn acquire(&self, _search_path: &SearchPath) -> anyhow::Result<Arc<dyn PipelineLoader>> {
            anyhow::bail!("no engine in this container")
        }
    }

    fn frames(events: &[serde_json::Value]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for event in events {
            write_frame(&mut buf, &json!({"event": event, "context": {"requestId": "r-1"}})).unwrap();
        }
        Cursor::new(buf)
    }

    fn replies(mut out: &[u8]) -> Vec<InvocationReply> {
        let mut replies = Vec::new();
        while let Some(reply) = read_frame(&mut out).unwrap() {
            replies.push(reply);
        }
        replies
    }

    #[tokio::test]
    async fn test_cold_start_failures_become_invocation_failures() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("layer-0")).unwrap();
        let dispatcher = Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(tmp.path().to_path_buf()),
            Arc::new(NoLoader),
        ));

        let mut out = Vec::new();
        let answered = serve(
            &dispatcher,
            frames(&[json!({"pipeline": "a"}), json!({"pipeline": "b"})]),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(answered, 2);
        let replies = replies(&out);
        assert_eq!(replies.len(), 2);
        for reply in replies {
            match reply {
                InvocationReply::Failure(failure) => {
                    assert_eq!(failure.error_type, ErrorKind::ColdStartError);
                    assert!(failure.error_message.contains("no engine"));
                }
                other => panic!("expected failure, got {:?}", other),
            }
        }
        // each invocation retried the cold start
        assert_eq!(dispatcher.bootstrap().attempts(), 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(tmp.path().to_path_buf()),
            Arc::new(NoLoader),
        ));

        let mut input = Vec::new();
        input.extend_from_slice(&3u32.to_be_bytes());
        input.extend_from_slice(b"{{{");

        let mut out = Vec::new();
        serve(&dispatcher, Cursor::new(input), &mut out).await.unwrap();

        match &replies(&out)[..] {
            [InvocationReply::Response(response)] => {
                assert_eq!(response.error_kind(), Some(ErrorKind::ResolutionError));
            }
            other => panic!("unexpected replies {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(tmp.path().to_path_buf()),
            Arc::new(NoLoader),
        ));

        let mut input = Vec::new();
        input.extend_from_slice(&100u32.to_be_bytes());
        input.extend_from_slice(b"{}");

        let mut out = Vec::new();
        assert!(serve(&dispatcher, Cursor::new(input), &mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_input_answers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(Bootstrap::new(
            LayerSource::Discover(tmp.path().to_path_buf()),
            Arc::new(NoLoader),
        ));

        let mut out = Vec::new();
        assert_eq!(serve(&dispatcher, Cursor::new(Vec::new()), &mut out).await.unwrap(), 0);
        assert!(out.is_empty());
    }
}
