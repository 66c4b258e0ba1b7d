use std::fmt;

use serde::{Deserialize, Serialize};

/// The unit status surfaced to the operator at the end of every pass.
///
/// There is no ordering between variants: each pass computes the status from
/// scratch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum Status {
    Active,
    Blocked(String),
    Waiting(String),
    Maintenance(String),
    Error(String),
}

impl Status {
    /// Lower-case status name as shown to the operator.
    pub fn name(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Blocked(_) => "blocked",
            Status::Waiting(_) => "waiting",
            Status::Maintenance(_) => "maintenance",
            Status::Error(_) => "error",
        }
    }

    /// The explanation carried by every status but `active`.
    pub fn message(&self) -> Option<&str> {
        match self {
            Status::Active => None,
            Status::Blocked(msg)
            | Status::Waiting(msg)
            | Status::Maintenance(msg)
            | Status::Error(msg) => Some(msg),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active)
    }
}

impl Default for Status {
    /// A unit reports maintenance until its first pass completes.
    fn default() -> Self {
        Status::Maintenance("awaiting first reconcile".to_string())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) if !msg.is_empty() => write!(f, "{}: {}", self.name(), msg),
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Status::Active.to_string(), "active");
        assert_eq!(
            Status::Blocked("invalid log-level 'trace'".into()).to_string(),
            "blocked: invalid log-level 'trace'"
        );
        assert_eq!(Status::Waiting(String::new()).to_string(), "waiting");
    }

    #[test]
    fn serializes_with_name_and_message() {
        let json = serde_json::to_value(Status::Waiting("waiting for workload".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "waiting", "message": "waiting for workload"})
        );
        let json = serde_json::to_value(Status::Active).unwrap();
        assert_eq!(json, serde_json::json!({"status": "active"}));
    }
}
