//! Multipart live stream served to each HTTP client.
//!
//! Browsers render `multipart/x-mixed-replace` natively: `<img src="/">` keeps
//! replacing the picture with every part that arrives.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream};

use crate::pipeline::{FrameCursor, SessionGuard, StreamPipeline};
use crate::Frame;

/// Boundary token separating parts
pub const BOUNDARY: &str = "frame";

const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Boundary line, part headers, frame bytes and trailing CRLF
pub fn encode_part(frame: &Frame, content_type: &str) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );

    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(&frame.data);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

struct Session {
    guard: SessionGuard,
    cursor: FrameCursor,
}

/// Endless stream of encoded parts for one client.
///
/// A take that times out writes nothing and retries, so an idle camera keeps
/// the connection open. The stream ends when the pipeline shuts down or its
/// source finishes; dropping it (client gone) releases the session.
pub fn frame_stream(
    pipeline: Arc<StreamPipeline>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let session = Session {
        guard: pipeline.open_session(),
        cursor: FrameCursor::new(),
    };

    stream::unfold(session, |mut session| async move {
        let pipeline = session.guard.pipeline().clone();
        let cancel = pipeline.cancel_token().clone();

        while pipeline.is_active() {
            let taken = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = pipeline.buffer().take(&mut session.cursor, pipeline.take_timeout()) => frame,
            };

            if let Some(frame) = taken {
                metrics::histogram!("camrelay_frame_delivery_seconds", "stream" => pipeline.name().to_owned())
                    .record(frame.age().as_secs_f64());
                let part = encode_part(&frame, pipeline.content_type());
                return Some((Ok(part), session));
            }
        }
        None
    })
}

pub fn response(pipeline: Arc<StreamPipeline>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Body::from_stream(frame_stream(pipeline)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::time::timeout;

    use super::*;

    fn pipeline(take_timeout: Duration) -> Arc<StreamPipeline> {
        Arc::new(StreamPipeline::new("test", 4, take_timeout))
    }

    #[test]
    fn part_layout() {
        let frame = Frame::new(Bytes::from_static(b"\xFF\xD8abc\xFF\xD9"), 1);
        let part = encode_part(&frame, "image/jpeg");

        let mut expected =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 7\r\n\r\n".to_vec();
        expected.extend_from_slice(b"\xFF\xD8abc\xFF\xD9\r\n");
        assert_eq!(part.as_ref(), expected.as_slice());
    }

    #[test]
    fn response_headers() {
        let response = response(pipeline(Duration::from_secs(1)));
        let headers = response.headers();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::EXPIRES], "0");
    }

    #[tokio::test]
    async fn idle_stream_waits_then_delivers() {
        let pipeline = pipeline(Duration::from_secs(1));
        let mut parts = Box::pin(frame_stream(pipeline.clone()));

        // Two full take timeouts pass with nothing written and no error
        assert!(timeout(Duration::from_millis(2500), parts.next()).await.is_err());
        assert_eq!(pipeline.clients(), 1);

        pipeline.publish(Frame::new(Bytes::from_static(b"\xFF\xD8x\xFF\xD9"), 1));
        let part = timeout(Duration::from_millis(1500), parts.next())
            .await
            .expect("frame written within one read cycle")
            .expect("stream still open")
            .unwrap();
        assert!(part.ends_with(b"\xFF\xD8x\xFF\xD9\r\n"));
    }

    #[tokio::test]
    async fn shutdown_ends_stream_without_client_disconnect() {
        let pipeline = pipeline(Duration::from_secs(1));
        let mut parts = Box::pin(frame_stream(pipeline.clone()));

        let waiter = tokio::spawn(async move { parts.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.shutdown();

        let ended = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("stream ends within one timeout interval")
            .unwrap();
        assert!(ended);
        assert_eq!(pipeline.clients(), 0);
    }

    #[tokio::test]
    async fn finished_source_ends_stream() {
        let pipeline = pipeline(Duration::from_millis(100));
        let mut parts = Box::pin(frame_stream(pipeline.clone()));
        pipeline.mark_inactive();

        let next = timeout(Duration::from_secs(1), parts.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn dropped_client_releases_session_only() {
        let pipeline = pipeline(Duration::from_millis(100));
        let first = Box::pin(frame_stream(pipeline.clone()));
        let mut second = Box::pin(frame_stream(pipeline.clone()));
        assert_eq!(pipeline.clients(), 2);

        drop(first);
        assert_eq!(pipeline.clients(), 1);

        pipeline.publish(Frame::new(Bytes::from_static(b"\xFF\xD8y\xFF\xD9"), 1));
        let part = timeout(Duration::from_secs(1), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(part.starts_with(b"--frame\r\n"));
    }
}
