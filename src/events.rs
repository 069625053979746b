use serde::Serialize;
use tokio::sync::broadcast;

/// Progress published while a session plans and executes test cases.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Planning {
        case_id: String,
        description: String,
    },
    Planned {
        case_id: String,
        steps: Vec<String>,
    },
    StepStarted {
        index: usize,
        summary: String,
    },
    StepRetry {
        index: usize,
        attempt: u32,
        reason: String,
    },
    StepPassed {
        index: usize,
        duration_ms: u64,
    },
    StepFailed {
        index: usize,
        message: String,
    },
    StepSkipped {
        index: usize,
    },
    Aborted {
        reason: String,
    },
    CaseFinished {
        case_id: String,
        success: bool,
        message: String,
    },
    CaseError {
        case_id: String,
        message: String,
    },
    Ready,
}

impl AgentEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Planning { .. } => "planning",
            AgentEvent::Planned { .. } => "planned",
            AgentEvent::StepStarted { .. } => "step_started",
            AgentEvent::StepRetry { .. } => "step_retry",
            AgentEvent::StepPassed { .. } => "step_passed",
            AgentEvent::StepFailed { .. } => "step_failed",
            AgentEvent::StepSkipped { .. } => "step_skipped",
            AgentEvent::Aborted { .. } => "aborted",
            AgentEvent::CaseFinished { .. } => "case_finished",
            AgentEvent::CaseError { .. } => "case_error",
            AgentEvent::Ready => "ready",
        }
    }
}

/// Optional fan-out of [`AgentEvent`]s; sending with no subscribers is fine.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    sender: Option<broadcast::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn new(sender: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let event = AgentEvent::StepFailed {
            index: 2,
            message: "element not found: text=Join".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_failed");
        assert_eq!(json["index"], 2);
        assert_eq!(event.name(), "step_failed");
    }

    #[tokio::test]
    async fn sink_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = EventSink::new(tx);
        sink.emit(AgentEvent::Ready);
        assert_eq!(rx.recv().await.unwrap(), AgentEvent::Ready);
        EventSink::disabled().emit(AgentEvent::Ready);
    }
}
