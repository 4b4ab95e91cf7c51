use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bus topic the call's signaling is scoped to.
    pub fn topic(&self) -> String {
        format!("calls/{}", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Who is calling whom. Owned by the call-session store; immutable for the
/// lifetime of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: ParticipantId,
    pub callee_id: ParticipantId,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        callee_id: impl Into<String>,
    ) -> Self {
        Self {
            call_id: CallId::new(call_id),
            caller_id: ParticipantId::new(caller_id),
            callee_id: ParticipantId::new(callee_id),
        }
    }

    pub fn role_of(&self, identity: &ParticipantId) -> Role {
        if *identity == self.caller_id {
            Role::Caller
        } else {
            Role::Callee
        }
    }

    pub fn includes(&self, identity: &ParticipantId) -> bool {
        *identity == self.caller_id || *identity == self.callee_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The polite peer yields on glare; the impolite peer's offer wins.
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Callee)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_derived_from_caller_id() {
        let session = CallSession::new("123", "alice", "bob");
        assert_eq!(session.role_of(&"alice".into()), Role::Caller);
        assert_eq!(session.role_of(&"bob".into()), Role::Callee);
        assert!(Role::Callee.is_polite());
        assert!(!Role::Caller.is_polite());
    }

    #[test]
    fn outsiders_are_not_participants() {
        let session = CallSession::new("123", "alice", "bob");
        assert!(session.includes(&"bob".into()));
        assert!(!session.includes(&"mallory".into()));
        assert_eq!(session.call_id.topic(), "calls/123");
    }
}
