use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the writer needs to know about a span.
///
/// The writer never looks inside spans beyond this; encoding is left to a
/// [`TraceEncoder`](crate::TraceEncoder).
pub trait TraceSpan: Send + 'static {
    /// True when this span is the local root of its trace.
    fn is_root(&self) -> bool;
}

/// A finished trace: its spans, local root first when the trace is complete.
pub type Trace<S> = Vec<S>;

/// Datadog-style finished span.
///
/// Times are nanoseconds; `parent_id == 0` marks the local root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub name: String,
    pub service: String,
    pub resource: String,
    pub start: u64,
    pub duration: u64,
    pub error: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl Span {
    /// Root span of a new trace.
    pub fn root(trace_id: u64, name: impl Into<String>, service: impl Into<String>) -> Self {
        Self::new(trace_id, trace_id, 0, name, service)
    }

    /// Child of `parent`, in the same trace.
    pub fn child_of(parent: &Span, span_id: u64, name: impl Into<String>) -> Self {
        Self::new(
            parent.trace_id,
            span_id,
            parent.span_id,
            name,
            parent.service.clone(),
        )
    }

    fn new(
        trace_id: u64,
        span_id: u64,
        parent_id: u64,
        name: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            trace_id,
            span_id,
            parent_id,
            resource: name.clone(),
            name,
            service: service.into(),
            start: 0,
            duration: 0,
            error: 0,
            meta: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_timing(mut self, start: u64, duration: u64) -> Self {
        self.start = start;
        self.duration = duration;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_error(mut self) -> Self {
        self.error = 1;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

impl TraceSpan for Span {
    fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_child() {
        let root = Span::root(7, "web.request", "shop");
        let child = Span::child_of(&root, 8, "db.query").with_resource("SELECT 1");

        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(child.trace_id, 7);
        assert_eq!(child.parent_id, 7);
        assert_eq!(child.service, "shop");
        assert_eq!(child.resource, "SELECT 1");
    }

    #[test]
    fn test_empty_tags_are_not_serialized() {
        let span = Span::root(1, "op", "svc");
        let json = serde_json::to_string(&span).unwrap();
        assert!(!json.contains("meta"));
        assert!(!json.contains("metrics"));

        let tagged = span.with_tag("env", "prod").with_metric("_sampling_priority_v1", 1.0);
        let json = serde_json::to_string(&tagged).unwrap();
        let back: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tagged);
    }
}
