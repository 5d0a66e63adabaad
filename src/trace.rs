use std::fmt;

use http::{HeaderMap, HeaderValue};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const SPAN_ID_HEADER: &str = "x-b3-spanid";

/// Correlation identifiers attached to outbound requests and to diagnostics.
///
/// A child span keeps the trace id of its parent and gets a fresh span id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    trace_id: String,
    span_id: String,
    origin: Option<String>,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            origin: None,
        }
    }

    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    pub fn create_span(&self, origin: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            origin: Some(origin.into()),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Sets the B3 trace headers, replacing any previous values.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        // Ids are hex strings, always valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.trace_id) {
            headers.insert(TRACE_ID_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.span_id) {
            headers.insert(SPAN_ID_HEADER, value);
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}

fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}
