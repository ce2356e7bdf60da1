//! HTTP access and journal logging.
//!
//! # Data Flow
//! ```text
//! request
//!     → ensure log id
//!     → request record (journal: after the body is captured)
//!     → next handler / round-tripper
//!     → response record (journal: after the body is captured)
//! ```
//!
//! The same logger wraps server handlers (`svr.*` records) and client
//! round-trippers (`cli.*` records). Access mode never touches bodies.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Response, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use http_body_util::BodyExt;

use super::capture::{record_type, Capture, Direction, JournalConfig, Plan, Side, TeeBody};
use super::log_id::{self, LogId};
use super::record::{LogRecord, RequestRecord, ResponseRecord, Template};
use super::redact::{mime_essence, Redactor};
use super::sink::LogSink;
use crate::error::{ErrorContext, ErrorHandler, GatewayError};
use crate::http::context::RemoteAddr;
use crate::http::handler::{handler_fn, tripper_fn, BoxError, Handler, Tripper};
use crate::http::middleware::{Middleware, Tripperware};
use crate::http::{round_trip, serve};

const COMPRESSED_ENCODINGS: [&str; 6] = ["gzip", "x-gzip", "deflate", "br", "zstd", "compress"];

/// Logs HTTP exchanges through a [`LogSink`].
#[derive(Clone)]
pub struct HttpLogger {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn LogSink>,
    template: Option<Template>,
    redactor: Redactor,
    journal: Option<JournalConfig>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl HttpLogger {
    /// Build a logger. A template requires a sink with a raw writer.
    pub fn new(
        sink: Arc<dyn LogSink>,
        template: Option<Template>,
        redactor: Redactor,
        journal: Option<JournalConfig>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, GatewayError> {
        if template.is_some() && sink.raw_writer().is_none() {
            return Err(GatewayError::create_object(
                "http logger",
                "template formatting requires a sink with a raw writer",
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sink,
                template,
                redactor,
                journal,
                error_handler,
            }),
        })
    }

    pub fn is_journal(&self) -> bool {
        self.inner.journal.is_some()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn content_length(headers: &HeaderMap) -> i64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

fn content_mime(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(mime_essence)
        .unwrap_or_default()
}

fn is_compressed(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|enc| {
            let enc = enc.trim();
            COMPRESSED_ENCODINGS.iter().any(|c| c.eq_ignore_ascii_case(enc))
        })
}

/// Request fields kept for rendering an error after the body was consumed.
struct RequestHead {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl Inner {
    fn emit(&self, record: LogRecord) {
        match (&self.template, self.sink.raw_writer()) {
            (Some(template), Some(raw)) => {
                if let Err(e) = raw.write_line(template.render(&record).as_bytes()) {
                    tracing::warn!(error = %e, "Failed to write log line");
                }
            }
            _ => self.sink.write_record(&record),
        }
    }

    fn request_record(&self, side: Side, id: &LogId, req: &Request<Body>) -> RequestRecord {
        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        RequestRecord {
            typ: record_type(side, Direction::Request),
            id: id.0.clone(),
            time: now(),
            host,
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: self.redactor.query(req.uri().query().unwrap_or("")),
            remote: req
                .extensions()
                .get::<RemoteAddr>()
                .map(|r| r.0.to_string())
                .unwrap_or_default(),
            proto: format!("{:?}", req.version()),
            size: content_length(req.headers()),
            header: self.redactor.headers(req.headers()),
            body: None,
        }
    }

    fn response_record(&self, side: Side, id: &LogId, started: Instant, res: &Response<Body>) -> ResponseRecord {
        ResponseRecord {
            typ: record_type(side, Direction::Response),
            id: id.0.clone(),
            time: now(),
            duration: i64::try_from(started.elapsed().as_micros()).unwrap_or(i64::MAX),
            status: res.status().as_u16(),
            size: content_length(res.headers()),
            header: self.redactor.headers(res.headers()),
            body: None,
        }
    }

    fn render_body(&self, headers: &HeaderMap, mime: &str, bytes: &[u8]) -> String {
        if is_compressed(headers) {
            return STANDARD.encode(bytes);
        }
        let redacted = self.redactor.body(mime, bytes);
        if self.journal.as_ref().is_some_and(|j| j.base64) {
            STANDARD.encode(&redacted)
        } else {
            String::from_utf8_lossy(&redacted).into_owned()
        }
    }

    /// Capture a message body according to the journal plan. `emit` is
    /// called exactly once with the logged body value.
    async fn capture(
        self: &Arc<Self>,
        side: Side,
        dir: Direction,
        id: &LogId,
        headers: &HeaderMap,
        body: Body,
        emit: Box<dyn FnOnce(Option<String>) + Send>,
    ) -> Result<Body, GatewayError> {
        let Some(journal) = &self.journal else {
            emit(None);
            return Ok(body);
        };
        let mime = content_mime(headers);
        match journal.plan(&id.0, side, dir, &mime, content_length(headers)) {
            Plan::Skip => {
                emit(None);
                Ok(body)
            }
            Plan::Buffer => {
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| GatewayError::Logger(format!("read body: {e}")))?
                    .to_bytes();
                emit(Some(self.render_body(headers, &mime, &bytes)));
                Ok(Body::from(bytes))
            }
            Plan::File(path) => match std::fs::File::create(&path) {
                Ok(file) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    emit(Some(name));
                    Ok(Body::new(TeeBody::new(body, Capture::file(file))))
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to create body file");
                    emit(None);
                    Ok(body)
                }
            },
            Plan::Stream => {
                let inner = self.clone();
                let headers = headers.clone();
                let limit = usize::try_from(journal.max_body.max(0)).unwrap_or(usize::MAX);
                let capture = Capture::buffer(
                    limit,
                    Box::new(move |bytes| {
                        let value = (!bytes.is_empty()).then(|| inner.render_body(&headers, &mime, &bytes));
                        emit(value);
                    }),
                );
                Ok(Body::new(TeeBody::new(body, capture)))
            }
        }
    }

    /// Log one exchange around `next`. `fail` converts a capture failure
    /// into the caller's result type.
    async fn exchange<F, Fut, E>(
        self: Arc<Self>,
        side: Side,
        mut req: Request<Body>,
        next: F,
        fail: impl FnOnce(RequestHead, GatewayError) -> Result<Response<Body>, E>,
    ) -> Result<Response<Body>, E>
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Result<Response<Body>, E>>,
    {
        if !self.sink.enabled() {
            return next(req).await;
        }

        let id = log_id::ensure(&mut req);
        let started = Instant::now();
        let record = self.request_record(side, &id, &req);

        let req = if self.journal.is_some() {
            let head = RequestHead {
                method: req.method().clone(),
                uri: req.uri().clone(),
                headers: req.headers().clone(),
            };
            let (parts, body) = req.into_parts();
            let inner = self.clone();
            let emit = Box::new(move |body| inner.emit(LogRecord::Request(RequestRecord { body, ..record })));
            match self.capture(side, Direction::Request, &id, &parts.headers, body, emit).await {
                Ok(body) => Request::from_parts(parts, body),
                Err(err) => {
                    tracing::error!(kind = %err.kind(), id = %id, error = %err, "Request body capture failed");
                    return fail(head, err);
                }
            }
        } else {
            self.emit(LogRecord::Request(record));
            req
        };

        let res = next(req).await?;
        let record = self.response_record(side, &id, started, &res);

        if self.journal.is_none() {
            self.emit(LogRecord::Response(record));
            return Ok(res);
        }

        let (parts, body) = res.into_parts();
        let inner = self.clone();
        let emit = Box::new(move |body| inner.emit(LogRecord::Response(ResponseRecord { body, ..record })));
        match self.capture(side, Direction::Response, &id, &parts.headers, body, emit).await {
            Ok(body) => Ok(Response::from_parts(parts, body)),
            Err(err) => {
                tracing::error!(kind = %err.kind(), id = %id, error = %err, "Response body capture failed");
                Ok(Response::from_parts(parts, Body::empty()))
            }
        }
    }
}

impl Middleware for HttpLogger {
    fn middleware(&self, next: Handler) -> Handler {
        let inner = self.inner.clone();
        handler_fn(move |req: Request<Body>| {
            let inner = inner.clone();
            let next = next.clone();
            async move {
                let error_handler = inner.error_handler.clone();
                let result = inner
                    .exchange(
                        Side::Server,
                        req,
                        |req| async move { Ok::<_, std::convert::Infallible>(serve(&next, req).await) },
                        move |head, err| {
                            let ctx = ErrorContext {
                                method: &head.method,
                                uri: &head.uri,
                                headers: &head.headers,
                            };
                            Ok(error_handler.serve_http_error(ctx, &err))
                        },
                    )
                    .await;
                match result {
                    Ok(res) => res,
                    Err(never) => match never {},
                }
            }
        })
    }
}

impl Tripperware for HttpLogger {
    fn tripperware(&self, next: Tripper) -> Tripper {
        let inner = self.inner.clone();
        tripper_fn(move |req: Request<Body>| {
            let inner = inner.clone();
            let next = next.clone();
            async move {
                inner
                    .exchange(
                        Side::Client,
                        req,
                        |req| async move { round_trip(&next, req).await },
                        |_head, err| Err::<Response<Body>, BoxError>(err.into()),
                    )
                    .await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::observability::capture::JournalConfig;
    use crate::observability::redact::RedactConfig;
    use crate::observability::sink::WriterSink;
    use axum::http::StatusCode;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);

    impl Write for Buf {
        fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(b);
            Ok(b.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
        }
    }

    fn echo() -> Handler {
        handler_fn(|req: Request<Body>| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, body.len())
                .body(Body::from(body))
                .unwrap()
        })
    }

    fn logger(buf: &Buf, journal: Option<JournalConfig>) -> HttpLogger {
        let redact: RedactConfig = toml::from_str(r#"headers = [{ name = "content-type" }]"#).unwrap();
        HttpLogger::new(
            Arc::new(WriterSink::new(buf.clone())),
            None,
            Redactor::new(&redact).unwrap(),
            journal,
            Arc::new(JsonErrorHandler),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn access_mode_logs_request_and_response() {
        let buf = Buf::default();
        let h = logger(&buf, None).middleware(echo());
        let req = Request::post("/items?x=1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let res = serve(&h, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let lines = buf.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "svr.req");
        assert_eq!(lines[0]["method"], "POST");
        assert_eq!(lines[0]["query"], "x=1");
        assert_eq!(lines[0]["header"]["Content-Type"][0], "application/json");
        assert!(lines[0].get("body").is_none());
        assert_eq!(lines[1]["type"], "svr.res");
        assert_eq!(lines[1]["status"], 200);
        assert_eq!(lines[0]["id"], lines[1]["id"]);
        assert_eq!(lines[0]["id"].as_str().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn journal_mode_captures_small_bodies() {
        let buf = Buf::default();
        let journal = JournalConfig {
            mimes: vec!["application/json".into()],
            max_body: 1024,
            body_path: None,
            base64: false,
        };
        let h = logger(&buf, Some(journal)).middleware(echo());
        let req = Request::post("/")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, 13)
            .body(Body::from(r#"{"name":"a"}"#.to_string() + " "))
            .unwrap();
        let res = serve(&h, req).await;
        let echoed = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&echoed[..], br#"{"name":"a"} "#);

        let lines = buf.lines();
        assert_eq!(lines[0]["body"], r#"{"name":"a"} "#);
        assert_eq!(lines[1]["body"], r#"{"name":"a"} "#);
    }

    #[tokio::test]
    async fn template_without_raw_writer_is_rejected() {
        let res = HttpLogger::new(
            Arc::new(crate::observability::sink::TracingSink),
            Some(Template::parse("%status%").unwrap()),
            Redactor::default(),
            None,
            Arc::new(JsonErrorHandler),
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn template_lines_go_to_raw_writer() {
        let buf = Buf::default();
        let logger = HttpLogger::new(
            Arc::new(WriterSink::new(buf.clone())),
            Some(Template::parse("%type% %method% %status%").unwrap()),
            Redactor::default(),
            None,
            Arc::new(JsonErrorHandler),
        )
        .unwrap();
        let h = logger.middleware(echo());
        serve(&h, Request::get("/").body(Body::empty()).unwrap()).await;
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "svr.req GET \nsvr.res  200\n");
    }

    #[tokio::test]
    async fn client_side_records_use_cli_types() {
        let buf = Buf::default();
        let upstream = tripper_fn(|_req| async { Ok(Response::new(Body::from("up"))) });
        let t = logger(&buf, None).tripperware(upstream);
        let req = Request::get("http://upstream.local/x").body(Body::empty()).unwrap();
        round_trip(&t, req).await.unwrap();
        let lines = buf.lines();
        assert_eq!(lines[0]["type"], "cli.req");
        assert_eq!(lines[0]["host"], "upstream.local");
        assert_eq!(lines[1]["type"], "cli.res");
    }

    #[test]
    fn detects_compressed_encodings() {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_ENCODING, "identity, GZIP".parse().unwrap());
        assert!(is_compressed(&h));
        h.insert(header::CONTENT_ENCODING, "identity".parse().unwrap());
        assert!(!is_compressed(&h));
    }
}
