//! HTTP log records and the `%tag%` line template.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::GatewayError;

/// Request record, emitted as `svr.req` or `cli.req`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestRecord {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub id: String,
    pub time: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub query: String,
    pub remote: String,
    pub proto: String,
    pub size: i64,
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response record, emitted as `svr.res` or `cli.res`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseRecord {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub id: String,
    pub time: String,
    /// Microseconds since the request record.
    pub duration: i64,
    pub status: u16,
    pub size: i64,
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum LogRecord {
    Request(RequestRecord),
    Response(ResponseRecord),
}

impl LogRecord {
    pub fn typ(&self) -> &'static str {
        match self {
            LogRecord::Request(r) => r.typ,
            LogRecord::Response(r) => r.typ,
        }
    }

    fn header(&self) -> &BTreeMap<String, Vec<String>> {
        match self {
            LogRecord::Request(r) => &r.header,
            LogRecord::Response(r) => &r.header,
        }
    }

    /// Resolve a template tag. Tags that do not apply to this record kind
    /// resolve to an empty string.
    fn tag(&self, tag: &Tag) -> String {
        match (tag, self) {
            (Tag::Type, _) => self.typ().to_string(),
            (Tag::Id, LogRecord::Request(r)) => r.id.clone(),
            (Tag::Id, LogRecord::Response(r)) => r.id.clone(),
            (Tag::Time, LogRecord::Request(r)) => r.time.clone(),
            (Tag::Time, LogRecord::Response(r)) => r.time.clone(),
            (Tag::Host, LogRecord::Request(r)) => r.host.clone(),
            (Tag::Method, LogRecord::Request(r)) => r.method.clone(),
            (Tag::Path, LogRecord::Request(r)) => r.path.clone(),
            (Tag::Query, LogRecord::Request(r)) => r.query.clone(),
            (Tag::Remote, LogRecord::Request(r)) => r.remote.clone(),
            (Tag::Proto, LogRecord::Request(r)) => r.proto.clone(),
            (Tag::Size, LogRecord::Request(r)) => r.size.to_string(),
            (Tag::Size, LogRecord::Response(r)) => r.size.to_string(),
            (Tag::Status, LogRecord::Response(r)) => r.status.to_string(),
            (Tag::Duration, LogRecord::Response(r)) => r.duration.to_string(),
            (Tag::Body, LogRecord::Request(r)) => r.body.clone().unwrap_or_default(),
            (Tag::Body, LogRecord::Response(r)) => r.body.clone().unwrap_or_default(),
            (Tag::Header(name), _) => self
                .header()
                .get(name)
                .map(|v| v.join(","))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tag {
    Type,
    Id,
    Time,
    Host,
    Method,
    Path,
    Query,
    Remote,
    Proto,
    Size,
    Status,
    Duration,
    Body,
    Header(String),
}

impl Tag {
    fn parse(name: &str) -> Option<Tag> {
        Some(match name {
            "type" => Tag::Type,
            "id" => Tag::Id,
            "time" => Tag::Time,
            "host" => Tag::Host,
            "method" => Tag::Method,
            "path" => Tag::Path,
            "query" => Tag::Query,
            "remote" => Tag::Remote,
            "proto" => Tag::Proto,
            "size" => Tag::Size,
            "status" => Tag::Status,
            "duration" => Tag::Duration,
            "body" => Tag::Body,
            _ => {
                let header = name.strip_prefix("header.")?;
                if header.is_empty() {
                    return None;
                }
                Tag::Header(crate::http::canonical_header_key(header))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Tag(Tag),
}

/// A parsed line template such as `%time% %method% %path% %status%`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template. `%%` is a literal percent sign; unknown tags are
    /// rejected.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find('%') {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('%') else {
                return Err(GatewayError::create_object(
                    "template",
                    format!("unterminated tag in {text:?}"),
                ));
            };
            let name = &after[..end];
            if name.is_empty() {
                literal.push('%');
            } else {
                let tag = Tag::parse(name).ok_or_else(|| {
                    GatewayError::create_object("template", format!("unknown tag %{name}%"))
                })?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Tag(tag));
            }
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Render one line, newline-terminated.
    pub fn render(&self, record: &LogRecord) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Tag(tag) => out.push_str(&record.tag(tag)),
            }
        }
        out.push('\n');
        out
    }
}
