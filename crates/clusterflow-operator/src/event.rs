//! Cluster events
//!
//! Watch envelopes are decoded once, at the source, into [`ClusterEvent`].
//! Nothing downstream inspects the raw payload again.

use crate::error::{OperatorError, Result};
use crate::spec::ClusterSpec;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

/// A lifecycle transition of one cluster
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Add(ClusterSpec),
    Delete(ClusterSpec),
}

impl ClusterEvent {
    pub fn spec(&self) -> &ClusterSpec {
        match self {
            ClusterEvent::Add(spec) | ClusterEvent::Delete(spec) => spec,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.spec().cluster_id
    }

    pub fn action(&self) -> &'static str {
        match self {
            ClusterEvent::Add(_) => "add",
            ClusterEvent::Delete(_) => "delete",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WatchEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    object: ClusterObject,
}

#[derive(Debug, Deserialize)]
struct ClusterObject {
    #[serde(default)]
    metadata: ObjectMeta,
    spec: ClusterSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
}

/// Decode one watch envelope.
///
/// `MODIFIED` yields `None`: spec changes are not reconciled against
/// existing resources.
pub fn decode_event(line: &str) -> Result<Option<ClusterEvent>> {
    let envelope: WatchEnvelope =
        serde_json::from_str(line).map_err(|e| OperatorError::Event(e.to_string()))?;

    let mut spec = envelope.object.spec;
    if spec.cluster_id.is_empty() {
        spec.cluster_id = envelope.object.metadata.name;
    }

    match envelope.event_type.as_str() {
        "ADDED" => Ok(Some(ClusterEvent::Add(spec))),
        "DELETED" => Ok(Some(ClusterEvent::Delete(spec))),
        "MODIFIED" => {
            tracing::debug!(cluster = %spec.cluster_id, "ignoring MODIFIED event");
            Ok(None)
        }
        other => Err(OperatorError::Event(format!("unknown event type '{}'", other))),
    }
}

/// Source of cluster events
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted.
    ///
    /// A malformed entry is returned as an error; the source stays usable.
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>>;
}

/// Newline-delimited watch envelopes
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match decode_event(line) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(OperatorError::Event(msg)) => {
                    return Err(OperatorError::Event(format!("line {}: {}", self.line_no, msg)));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
