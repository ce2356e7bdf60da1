//! Body capture for journal logging.
//!
//! # Capture plan
//! ```text
//! MIME not listed or Content-Length == 0  → skip
//! 0 < Content-Length < max_body           → buffer fully, log inline
//! body_path configured                    → tee into body-<id>.<side>.<dir>.bin,
//!                                           log the file name
//! Content-Length unknown                  → tee into a bounded buffer,
//!                                           log when the stream ends
//! otherwise                               → skip
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Server => "svr",
            Side::Client => "cli",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "req",
            Direction::Response => "res",
        }
    }
}

/// Record type tag such as `svr.req`.
pub fn record_type(side: Side, dir: Direction) -> &'static str {
    match (side, dir) {
        (Side::Server, Direction::Request) => "svr.req",
        (Side::Server, Direction::Response) => "svr.res",
        (Side::Client, Direction::Request) => "cli.req",
        (Side::Client, Direction::Response) => "cli.res",
    }
}

/// Body capture settings of a journal logger.
#[derive(Debug, Clone, Default)]
pub struct JournalConfig {
    /// MIME essences whose bodies are captured.
    pub mimes: Vec<String>,
    /// Inline buffering limit in bytes, exclusive.
    pub max_body: i64,
    /// Directory for body files.
    pub body_path: Option<PathBuf>,
    /// Base64-encode captured bodies.
    pub base64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Skip,
    Buffer,
    File(PathBuf),
    Stream,
}

pub fn body_file_name(id: &str, side: Side, dir: Direction) -> String {
    format!("body-{}.{}.{}.bin", id, side.as_str(), dir.as_str())
}

impl JournalConfig {
    pub fn plan(&self, id: &str, side: Side, dir: Direction, mime: &str, content_length: i64) -> Plan {
        if !self.mimes.iter().any(|m| m.eq_ignore_ascii_case(mime)) || content_length == 0 {
            return Plan::Skip;
        }
        if content_length > 0 && content_length < self.max_body {
            return Plan::Buffer;
        }
        if let Some(dir_path) = &self.body_path {
            return Plan::File(dir_path.join(body_file_name(id, side, dir)));
        }
        if content_length < 0 {
            return Plan::Stream;
        }
        Plan::Skip
    }
}

/// Called once with the captured bytes when the stream ends or is dropped.
pub type OnComplete = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Destination of teed body bytes.
pub struct Capture {
    buf: Vec<u8>,
    limit: usize,
    file: Option<BufWriter<File>>,
    on_complete: Option<OnComplete>,
}

impl Capture {
    /// Keep up to `limit` bytes in memory.
    pub fn buffer(limit: usize, on_complete: OnComplete) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            file: None,
            on_complete: Some(on_complete),
        }
    }

    /// Copy every byte into `file`.
    pub fn file(file: File) -> Self {
        Self {
            buf: Vec::new(),
            limit: 0,
            file: Some(BufWriter::new(file)),
            on_complete: None,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if let Some(file) = &mut self.file {
            if let Err(e) = file.write_all(data) {
                tracing::warn!(error = %e, "Failed to write captured body; capture stopped");
                self.file = None;
            }
        }
        let room = self.limit.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(error = %e, "Failed to flush captured body");
            }
        }
        if let Some(done) = self.on_complete.take() {
            done(std::mem::take(&mut self.buf));
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.finish();
    }
}

pin_project! {
    /// A body that copies its data frames into a [`Capture`].
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        capture: Capture,
    }
}

impl<B> TeeBody<B> {
    pub fn new(inner: B, capture: Capture) -> Self {
        Self { inner, capture }
    }
}

impl<B> HttpBody for TeeBody<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.push(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.capture.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use std::sync::{Arc, Mutex};

    fn journal(body_path: Option<PathBuf>) -> JournalConfig {
        JournalConfig {
            mimes: vec!["application/json".into()],
            max_body: 1024,
            body_path,
            base64: false,
        }
    }

    #[test]
    fn plan_follows_length_and_mime() {
        let j = journal(None);
        let plan = |mime, cl| j.plan("id", Side::Server, Direction::Request, mime, cl);
        assert_eq!(plan("text/html", 10), Plan::Skip);
        assert_eq!(plan("application/json", 0), Plan::Skip);
        assert_eq!(plan("application/json", 10), Plan::Buffer);
        assert_eq!(plan("application/json", -1), Plan::Stream);
        assert_eq!(plan("application/json", 4096), Plan::Skip);

        let j = journal(Some(PathBuf::from("/tmp/bodies")));
        assert_eq!(
            j.plan("abc", Side::Client, Direction::Response, "application/json", 4096),
            Plan::File(PathBuf::from("/tmp/bodies/body-abc.cli.res.bin"))
        );
    }

    #[tokio::test]
    async fn tee_reports_bytes_at_end_of_stream() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let capture = Capture::buffer(
            5,
            Box::new(move |bytes| {
                *sink.lock().unwrap() = Some(bytes);
            }),
        );
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("abc")),
            Ok(Bytes::from("defg")),
        ]);
        let body = TeeBody::new(Body::from_stream(chunks), capture);
        let all = body.collect().await.unwrap().to_bytes();

        assert_eq!(&all[..], b"abcdefg");
        assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"abcde"[..]));
    }

    #[test]
    fn dropped_capture_still_reports() {
        let seen = Arc::new(Mutex::new(false));
        let flag = seen.clone();
        drop(Capture::buffer(1, Box::new(move |_| *flag.lock().unwrap() = true)));
        assert!(*seen.lock().unwrap());
    }

    #[tokio::test]
    async fn file_capture_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(body_file_name("x", Side::Server, Direction::Request));
        let file = File::create(&path).unwrap();
        let body = TeeBody::new(Body::from("payload"), Capture::file(file));
        body.collect().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }
}
