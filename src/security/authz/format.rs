//! Policy row formats.
//!
//! Every format lowers onto the same row shape: a policy type (`p`, `g`,
//! `g2`, ...) followed by up to ten values. CSV is the native Casbin line
//! format; JSON, YAML and XML carry arrays of `{pType, v0..v9}`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::PolicyError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRow {
    #[serde(rename = "pType")]
    pub p_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v0: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v2: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v3: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v4: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v6: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v7: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v8: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v9: String,
}

impl PolicyRow {
    /// Build a row from CSV-style tokens: `ptype, v0, v1, ...`.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Option<Self> {
        let (p_type, values) = tokens.split_first()?;
        let p_type = p_type.as_ref().trim();
        if p_type.is_empty() {
            return None;
        }
        let mut row = PolicyRow {
            p_type: p_type.to_string(),
            ..Default::default()
        };
        for (slot, value) in row.values_mut().into_iter().zip(values) {
            *slot = value.as_ref().trim().to_string();
        }
        Some(row)
    }

    fn values_mut(&mut self) -> [&mut String; 10] {
        [
            &mut self.v0,
            &mut self.v1,
            &mut self.v2,
            &mut self.v3,
            &mut self.v4,
            &mut self.v5,
            &mut self.v6,
            &mut self.v7,
            &mut self.v8,
            &mut self.v9,
        ]
    }

    /// The rule values with trailing empty fields dropped.
    pub fn rule(&self) -> Vec<String> {
        let values = [
            &self.v0, &self.v1, &self.v2, &self.v3, &self.v4, &self.v5, &self.v6, &self.v7, &self.v8, &self.v9,
        ];
        let len = values.iter().rposition(|v| !v.is_empty()).map_or(0, |i| i + 1);
        values[..len].iter().map(|v| v.to_string()).collect()
    }

    /// Assertion section of the policy type: `p` or `g`.
    pub fn section(&self) -> &str {
        self.p_type.get(..1).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Csv,
    Json,
    Yaml,
    Xml,
}

impl PolicyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyFormat::Csv => "csv",
            PolicyFormat::Json => "json",
            PolicyFormat::Yaml => "yaml",
            PolicyFormat::Xml => "xml",
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(PolicyFormat::Csv),
            "json" => Ok(PolicyFormat::Json),
            "yaml" | "yml" => Ok(PolicyFormat::Yaml),
            "xml" => Ok(PolicyFormat::Xml),
            _ => Err(PolicyError::UnknownFormat(path.display().to_string())),
        }
    }

    /// Select a format from a `Content-Type` essence.
    pub fn from_content_type(mime: &str) -> Result<Self, PolicyError> {
        match mime {
            "application/csv" | "text/csv" => Ok(PolicyFormat::Csv),
            "application/json" | "text/json" => Ok(PolicyFormat::Json),
            "application/xml" | "text/xml" => Ok(PolicyFormat::Xml),
            "application/yaml" | "application/yml" | "text/yaml" | "text/yml" => Ok(PolicyFormat::Yaml),
            other => Err(PolicyError::UnknownFormat(other.to_string())),
        }
    }

    pub fn parse(&self, data: &[u8]) -> Result<Vec<PolicyRow>, PolicyError> {
        let parse_error = |reason: String| PolicyError::Parse {
            format: self.as_str(),
            reason,
        };
        let rows = match self {
            PolicyFormat::Csv => parse_csv(&String::from_utf8_lossy(data)),
            PolicyFormat::Json => serde_json::from_slice(data).map_err(|e| parse_error(e.to_string()))?,
            PolicyFormat::Yaml => serde_yaml::from_slice(data).map_err(|e| parse_error(e.to_string()))?,
            PolicyFormat::Xml => {
                let text = std::str::from_utf8(data).map_err(|e| parse_error(e.to_string()))?;
                quick_xml::de::from_str::<XmlPolicies>(text)
                    .map_err(|e| parse_error(e.to_string()))?
                    .rows
            }
        };
        if let Some(bad) = rows.iter().find(|r| !matches!(r.p_type.as_bytes().first(), Some(b'p' | b'g'))) {
            return Err(parse_error(format!("pType must start with p or g: {bad:?}")));
        }
        Ok(rows)
    }
}

/// `<Policies><Policy><pType>p</pType><v0>..</v0></Policy>...</Policies>`
#[derive(Debug, Default, Deserialize)]
struct XmlPolicies {
    #[serde(rename = "Policy", default)]
    rows: Vec<PolicyRow>,
}

/// Casbin CSV lines. Blank lines and `#` comments are skipped; double
/// quotes protect commas inside a value.
fn parse_csv(text: &str) -> Vec<PolicyRow> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| PolicyRow::from_tokens(&split_csv_line(line)))
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}
