//! Echo every bidirectional stream back to its sender.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::{ClientError, ClosedStream, Event, Observer, ReadError, Session, Stream, WriteError};

/// Bytes read from a stream before they're written back.
const CHUNK_SIZE: usize = 64 * 1024;

/// The paths an echo server answers on.
pub const PATHS: [&str; 2] = ["/echo", "/"];

#[derive(Error, Debug, Clone)]
pub enum EchoError {
    #[error("read failed: {0}")]
    Read(#[from] ReadError),

    #[error("write failed: {0}")]
    Write(#[from] WriteError),

    #[error("finish failed: {0}")]
    Finish(#[from] ClosedStream),
}

/// Echo every bidirectional stream of `session` on its own task.
///
/// Meant to be called from a route's `on_session_open` handler.
pub fn serve(session: &Session) {
    let observer = session.observer();
    session.set_stream_handler(move |stream| {
        let observer = observer.clone();
        async move {
            echo_stream(stream, observer).await;
        }
    });
}

/// Copy the read side of `stream` to its write side in order, then finish the write side.
///
/// Failures are reported to `observer` and never escape the stream.
pub async fn echo_stream(mut stream: Stream, observer: Arc<dyn Observer>) {
    let session = stream.session_id();
    let id = stream.id();

    match echo(&mut stream).await {
        Ok(bytes) => observer.on_event(&Event::StreamEchoed {
            session,
            stream: id,
            bytes,
        }),
        Err(err) => {
            tracing::warn!("failed to echo stream {id} of session {session}: {err}");
            observer.on_event(&Event::StreamFailed {
                session,
                stream: id,
                error: err.to_string(),
            });
        }
    }
}

async fn echo(stream: &mut Stream) -> Result<u64, EchoError> {
    let mut total = 0u64;

    while let Some(chunk) = stream.recv().read_chunk(CHUNK_SIZE).await? {
        stream.send().write_all(&chunk).await?;
        total += chunk.len() as u64;
    }

    stream.send().finish()?;
    Ok(total)
}

/// Send `payload` on a new stream, half-close it, and read the reply to the end.
pub async fn round_trip(session: &Session, payload: &[u8]) -> Result<Bytes, ClientError> {
    let (mut send, mut recv) = session.open_bi().await?.into_parts();

    tracing::debug!("sending {} bytes on stream {}", payload.len(), send.id());
    send.write_all(payload).await?;
    send.finish().map_err(|_| WriteError::ClosedStream)?;

    let reply = recv.read_all().await?;
    tracing::debug!("received {} bytes on stream {}", reply.len(), recv.id());

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_failed_step() {
        let err = EchoError::from(WriteError::Stopped(7));
        assert_eq!(err.to_string(), "write failed: STOP_SENDING: 7");

        let err = EchoError::from(ClosedStream);
        assert_eq!(err.to_string(), "finish failed: stream closed");
    }
}
