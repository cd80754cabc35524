use base64::{engine::general_purpose, Engine};
use serde_json::Value;

use super::ModelHost;
use crate::core::errors::{JobError, JobResult};

/// Image output of a prediction: either a link to download or the bytes themselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutput {
    Url(String),
    InlineBlob(Vec<u8>),
}

/// Decode a prediction `output` value.
///
/// Accepted shapes: a URL string, a `data:` URI, an array (first element wins)
/// or an object carrying a `url` field.
pub fn decode_output(output: &Value) -> JobResult<ModelOutput> {
    match output {
        Value::String(s) => decode_string(s),
        Value::Array(items) => items
            .first()
            .ok_or_else(|| JobError::InvalidOutput("empty output array".to_string()))
            .and_then(decode_output),
        Value::Object(map) => match map.get("url") {
            Some(Value::String(url)) => decode_string(url),
            _ => Err(JobError::InvalidOutput("object output without a url field".to_string())),
        },
        Value::Null => Err(JobError::InvalidOutput("prediction has no output".to_string())),
        other => Err(JobError::InvalidOutput(format!(
            "unsupported output shape: {}",
            kind_of(other)
        ))),
    }
}

fn decode_string(s: &str) -> JobResult<ModelOutput> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("data:") {
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| JobError::InvalidOutput("malformed data URI".to_string()))?;
        if !meta.ends_with(";base64") {
            return Err(JobError::InvalidOutput("data URI is not base64 encoded".to_string()));
        }
        let bytes = general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| JobError::InvalidOutput(format!("invalid base64 in data URI: {}", e)))?;
        return Ok(ModelOutput::InlineBlob(bytes));
    }

    if s.starts_with("http://") || s.starts_with("https://") {
        return Ok(ModelOutput::Url(s.to_string()));
    }

    Err(JobError::InvalidOutput(format!(
        "output string is neither a URL nor a data URI: {}",
        s.chars().take(60).collect::<String>()
    )))
}

/// Text output of a language model; token streams arrive as arrays of strings
pub fn decode_text(output: &Value) -> JobResult<String> {
    match output {
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.as_str()),
                other => Err(JobError::InvalidOutput(format!(
                    "text output contains a {}",
                    kind_of(other)
                ))),
            })
            .collect::<JobResult<Vec<_>>>()
            .map(|parts| parts.concat()),
        other => Err(JobError::InvalidOutput(format!(
            "expected text output, got {}",
            kind_of(other)
        ))),
    }
}

/// Bytes behind a decoded output, downloading URL outputs through the host
pub async fn resolve_bytes(host: &dyn ModelHost, output: ModelOutput) -> JobResult<Vec<u8>> {
    match output {
        ModelOutput::InlineBlob(bytes) => Ok(bytes),
        ModelOutput::Url(url) => Ok(host.fetch(&url).await?),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
