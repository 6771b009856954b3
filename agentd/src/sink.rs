//! Downstream rule-engine interface.
//!
//! The rule engine itself is out of scope (§1); this crate only owns
//! the boundary it's called through. Grounded on the existing
//! `Handler`/`HandlerList` pattern: a trait object per sink, a list
//! the driver fans a resolved event out to after C5 resolution.

use crate::event::{AbnormalPathReason, ResolvedEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait RuleEngineSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_event(&self, event: &ResolvedEvent);
    async fn on_abnormal_path(&self, event: &ResolvedEvent, reason: AbnormalPathReason);
}

#[derive(Default)]
pub struct SinkList {
    sinks: Vec<Arc<dyn RuleEngineSink>>,
}

impl SinkList {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<S: RuleEngineSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Arc::new(sink));
    }

    pub async fn dispatch(&self, event: &ResolvedEvent) {
        if let Some(reason) = event.abnormal_path.clone() {
            for sink in &self.sinks {
                sink.on_abnormal_path(event, reason.clone()).await;
            }
        }
        for sink in &self.sinks {
            sink.on_event(event).await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Built-in sink for smoke-testing without a real rule engine
/// attached: appends one JSON line per event (and one per abnormal
/// path) to a file.
pub struct JsonlSink {
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    async fn write_line(&self, line: &str) {
        let mut f = self.file.lock().await;
        let _ = f.write_all(line.as_bytes()).await;
        let _ = f.write_all(b"\n").await;
    }
}

#[async_trait]
impl RuleEngineSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn on_event(&self, event: &ResolvedEvent) {
        self.write_line(&format!(
            "{{\"cpu\":{},\"timestamp\":{},\"event_type\":{},\"path\":{:?}}}",
            event.cpu, event.timestamp, event.event_type, event.path
        ))
        .await;
    }

    async fn on_abnormal_path(&self, event: &ResolvedEvent, reason: AbnormalPathReason) {
        self.write_line(&format!(
            "{{\"abnormal_path\":true,\"cpu\":{},\"timestamp\":{},\"reason\":{:?}}}",
            event.cpu, event.timestamp, reason
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionShortfall;

    fn event(path: Option<&str>, abnormal: Option<AbnormalPathReason>) -> ResolvedEvent {
        ResolvedEvent {
            cpu: 0,
            timestamp: 1,
            event_type: 0,
            flags: 0,
            path: path.map(|s| s.to_string()),
            abnormal_path: abnormal,
        }
    }

    #[tokio::test]
    async fn jsonl_sink_writes_event_and_abnormal_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sink = JsonlSink::new(file.path().to_str().unwrap()).await.unwrap();
        let mut sinks = SinkList::new();
        sinks.register(sink);

        sinks.dispatch(&event(Some("/etc/passwd"), None)).await;
        sinks
            .dispatch(&event(Some("/partial"), Some(ResolutionShortfall::TruncatedParents)))
            .await;

        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert_eq!(content.lines().count(), 3); // 1 event + (1 abnormal + 1 event)
    }

    #[test]
    fn empty_sink_list_reports_empty() {
        assert!(SinkList::new().is_empty());
    }
}
