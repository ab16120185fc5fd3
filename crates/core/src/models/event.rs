use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobStep, RunStatus};

/// 步骤事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    StepStart,
    StepLog,
    StepEnd,
    Complete,
    Heartbeat,
    Connected,
}

impl StepEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepEventKind::StepStart => "step_start",
            StepEventKind::StepLog => "step_log",
            StepEventKind::StepEnd => "step_end",
            StepEventKind::Complete => "complete",
            StepEventKind::Heartbeat => "heartbeat",
            StepEventKind::Connected => "connected",
        }
    }
}

/// 步骤事件
///
/// 瞬时数据，不持久化。由步骤日志器产生，经日志流中心分发给当前订阅者后丢弃，
/// 不支持回放。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(rename = "type")]
    pub kind: StepEventKind,
    pub run_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepEvent {
    fn bare(kind: StepEventKind, run_id: i64) -> Self {
        Self {
            kind,
            run_id,
            step_id: None,
            ordinal: None,
            step_name: None,
            status: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    fn for_step(kind: StepEventKind, step: &JobStep) -> Self {
        Self {
            step_id: Some(step.id),
            ordinal: Some(step.ordinal),
            step_name: Some(step.name.clone()),
            status: Some(step.status.as_str().to_string()),
            ..Self::bare(kind, step.run_id)
        }
    }

    pub fn step_start(step: &JobStep) -> Self {
        Self::for_step(StepEventKind::StepStart, step)
    }

    pub fn step_log(step: &JobStep, line: &str) -> Self {
        Self {
            message: Some(line.to_string()),
            ..Self::for_step(StepEventKind::StepLog, step)
        }
    }

    pub fn step_end(step: &JobStep) -> Self {
        Self {
            message: step.error.clone(),
            ..Self::for_step(StepEventKind::StepEnd, step)
        }
    }

    pub fn complete(run_id: i64, status: RunStatus, message: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            message: Some(message.to_string()),
            ..Self::bare(StepEventKind::Complete, run_id)
        }
    }

    pub fn heartbeat(run_id: i64) -> Self {
        Self::bare(StepEventKind::Heartbeat, run_id)
    }

    pub fn connected(run_id: i64) -> Self {
        Self::bare(StepEventKind::Connected, run_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == StepEventKind::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let mut step = JobStep::running(7, 1, "下载");
        step.id = 3;
        let event = StepEvent::step_log(&step, "hello");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_log");
        assert_eq!(value["run_id"], 7);
        assert_eq!(value["step_id"], 3);
        assert_eq!(value["ordinal"], 1);
        assert_eq!(value["status"], "running");
        assert_eq!(value["message"], "hello");

        let heartbeat = serde_json::to_value(StepEvent::heartbeat(7)).unwrap();
        assert_eq!(heartbeat["type"], "heartbeat");
        assert!(heartbeat.get("step_id").is_none());
    }

    #[test]
    fn test_complete_event_is_terminal() {
        let event = StepEvent::complete(1, RunStatus::Failed, "boom");
        assert!(event.is_terminal());
        assert_eq!(event.status.as_deref(), Some("failed"));
        assert!(!StepEvent::connected(1).is_terminal());
    }
}
