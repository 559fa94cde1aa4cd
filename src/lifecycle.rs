use serde::Deserialize;

/// Container lifecycle event kinds the agent reacts to, decoded once at the
/// event-stream boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventKind {
    Create,
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
    Die,
    Kill,
    Destroy,
    Unknown,
}

impl ContainerEventKind {
    /// Every kind the per-connection monitors subscribe to.
    pub const MONITORED: [ContainerEventKind; 9] = [
        ContainerEventKind::Create,
        ContainerEventKind::Start,
        ContainerEventKind::Stop,
        ContainerEventKind::Restart,
        ContainerEventKind::Pause,
        ContainerEventKind::Unpause,
        ContainerEventKind::Die,
        ContainerEventKind::Kill,
        ContainerEventKind::Destroy,
    ];

    pub fn parse(action: &str) -> Self {
        match action {
            "create" => Self::Create,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "pause" => Self::Pause,
            "unpause" => Self::Unpause,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "destroy" => Self::Destroy,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Destroy => "destroy",
            Self::Unknown => "unknown",
        }
    }
}

/// One decoded entry from the runtime's event feed. Newer runtimes report the
/// action under `Action`, older ones under `status`; both are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "status", default)]
    pub legacy_status: String,
    #[serde(rename = "id", default)]
    pub container_id: String,
}

impl ContainerEvent {
    pub fn kind(&self) -> ContainerEventKind {
        let action = if self.action.is_empty() {
            &self.legacy_status
        } else {
            &self.action
        };
        ContainerEventKind::parse(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_monitored_kinds() {
        for kind in ContainerEventKind::MONITORED {
            assert_eq!(ContainerEventKind::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unrecognized_action_is_unknown() {
        assert_eq!(
            ContainerEventKind::parse("exec_create"),
            ContainerEventKind::Unknown
        );
    }

    #[test]
    fn test_event_kind_prefers_action_field() {
        let event: ContainerEvent =
            serde_json::from_str(r#"{"Action":"die","status":"start","id":"c1"}"#).unwrap();
        assert_eq!(event.kind(), ContainerEventKind::Die);
    }

    #[test]
    fn test_event_kind_falls_back_to_legacy_status() {
        let event: ContainerEvent =
            serde_json::from_str(r#"{"status":"restart","id":"c1"}"#).unwrap();
        assert_eq!(event.kind(), ContainerEventKind::Restart);
    }
}
