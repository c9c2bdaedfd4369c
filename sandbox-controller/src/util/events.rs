use kube::runtime::events::{Event, EventType, Recorder};

/// Closed set of event reasons this controller ever emits, matching
/// §6's pinned list verbatim so downstream tooling can match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    ClaimCompleted,
    SandboxClaimed,
    NoAvailableSandboxes,
    SandboxClaimTtlDelete,
    SandboxSetNotFound,
    UnknownPhase,
}

impl EventReason {
    fn as_str(self) -> &'static str {
        match self {
            EventReason::ClaimCompleted => "ClaimCompleted",
            EventReason::SandboxClaimed => "SandboxClaimed",
            EventReason::NoAvailableSandboxes => "NoAvailableSandboxes",
            EventReason::SandboxClaimTtlDelete => "SandboxClaimTTLDelete",
            EventReason::SandboxSetNotFound => "SandboxSetNotFound",
            EventReason::UnknownPhase => "UnknownPhase",
        }
    }

    fn event_type(self) -> EventType {
        match self {
            EventReason::NoAvailableSandboxes
            | EventReason::SandboxSetNotFound
            | EventReason::UnknownPhase => EventType::Warning,
            _ => EventType::Normal,
        }
    }
}

pub async fn publish(
    recorder: &Recorder,
    reason: EventReason,
    note: String,
    action: &str,
) -> Result<(), kube::Error> {
    recorder
        .publish(
            &Event {
                type_: reason.event_type(),
                reason: reason.as_str().to_string(),
                note: Some(note),
                action: action.to_string(),
                secondary: None,
            },
        )
        .await
}
