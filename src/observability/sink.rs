//! Destinations for HTTP log records.
//!
//! A sink receives structured records. Sinks that can also accept raw
//! preformatted lines expose a [`RawWriter`]; template formatting requires
//! one.
//!
//! Sinks are registered by name; `default` always resolves to a
//! [`TracingSink`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};

use super::record::LogRecord;

/// Accepts preformatted log lines.
pub trait RawWriter: Send + Sync {
    fn write_line(&self, line: &[u8]) -> io::Result<()>;
}

pub trait LogSink: Send + Sync {
    /// Whether records would be kept. Callers skip record assembly when false.
    fn enabled(&self) -> bool {
        true
    }

    fn write_record(&self, record: &LogRecord);

    fn raw_writer(&self) -> Option<&dyn RawWriter> {
        None
    }
}

/// Emits records as `tracing` events under the `gateway::http` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn enabled(&self) -> bool {
        tracing::enabled!(target: "gateway::http", tracing::Level::INFO)
    }

    fn write_record(&self, record: &LogRecord) {
        match record {
            LogRecord::Request(r) => tracing::info!(
                target: "gateway::http",
                log_type = r.typ,
                id = %r.id,
                time = %r.time,
                host = %r.host,
                method = %r.method,
                path = %r.path,
                query = %r.query,
                remote = %r.remote,
                proto = %r.proto,
                size = r.size,
                header = ?r.header,
                body = r.body.as_deref(),
                "HTTP request"
            ),
            LogRecord::Response(r) => tracing::info!(
                target: "gateway::http",
                log_type = r.typ,
                id = %r.id,
                time = %r.time,
                duration = r.duration,
                status = r.status,
                size = r.size,
                header = ?r.header,
                body = r.body.as_deref(),
                "HTTP response"
            ),
        }
    }
}

/// Writes records as JSON lines to any writer and accepts raw lines.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl WriterSink<File> {
    /// Append to a file, creating it when missing.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> RawWriter for WriterSink<W> {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(line)?;
        writer.flush()
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn write_record(&self, record: &LogRecord) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode log record");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.write_line(&line) {
            tracing::warn!(error = %e, "Failed to write log record");
        }
    }

    fn raw_writer(&self) -> Option<&dyn RawWriter> {
        Some(self)
    }
}

/// Name under which the tracing sink is always resolvable.
pub const DEFAULT_SINK: &str = "default";

static SINKS: LazyLock<RwLock<HashMap<String, Arc<dyn LogSink>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Look up a named sink. `default` falls back to [`TracingSink`].
pub fn get_sink(name: &str) -> Option<Arc<dyn LogSink>> {
    let sinks = SINKS.read();
    match sinks.get(name) {
        Some(sink) => Some(sink.clone()),
        None if name == DEFAULT_SINK || name.is_empty() => Some(Arc::new(TracingSink)),
        None => None,
    }
}

pub fn set_sink(name: impl Into<String>, sink: Arc<dyn LogSink>) {
    SINKS.write().insert(name.into(), sink);
}

pub fn delete_sink(name: &str) {
    SINKS.write().remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::record::{LogRecord, ResponseRecord};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory buffer shared with the test.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_sink_emits_json_lines() {
        let buf = SharedBuf::default();
        let sink = WriterSink::new(buf.clone());
        sink.write_record(&LogRecord::Response(ResponseRecord {
            typ: "cli.res",
            id: "x".into(),
            time: "t".into(),
            duration: 1,
            status: 200,
            size: 2,
            header: BTreeMap::new(),
            body: Some("ok".into()),
        }));
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(out.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(v["type"], "cli.res");
        assert_eq!(v["body"], "ok");
        assert!(sink.raw_writer().is_some());
    }

    #[test]
    fn registry_resolves_default() {
        assert!(get_sink(DEFAULT_SINK).is_some());
        assert!(get_sink("missing-sink").is_none());
        set_sink("mem", Arc::new(WriterSink::new(Vec::<u8>::new())));
        assert!(get_sink("mem").unwrap().raw_writer().is_some());
        delete_sink("mem");
        assert!(get_sink("mem").is_none());
        assert!(TracingSink.raw_writer().is_none());
    }
}
