use std::fmt;

use crate::error::StateError;

/// Prefix marking a token that references the session store.
pub const SESSION_PREFIX: &str = "session:";

/// One half of the state a client sends back: an inline blob or a session
/// store reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateToken {
    Inline(String),
    Session(String),
}

impl StateToken {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(SESSION_PREFIX) {
            Some(id) => StateToken::Session(id.to_string()),
            None => StateToken::Inline(raw.to_string()),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        StateToken::Session(id.into())
    }

    pub fn is_session(&self) -> bool {
        matches!(self, StateToken::Session(_))
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateToken::Inline(blob) => f.write_str(blob),
            StateToken::Session(id) => write!(f, "{SESSION_PREFIX}{id}"),
        }
    }
}

/// Static and dynamic tokens of one exchange. Both use the same mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub static_state: StateToken,
    pub dynamic_state: StateToken,
}

impl TokenPair {
    pub fn parse(static_state: &str, dynamic_state: &str) -> Result<Self, StateError> {
        let pair = Self {
            static_state: StateToken::parse(static_state),
            dynamic_state: StateToken::parse(dynamic_state),
        };
        if pair.static_state.is_session() != pair.dynamic_state.is_session() {
            return Err(StateError::InconsistentTokens);
        }
        Ok(pair)
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::of(&self.static_state.to_string(), &self.dynamic_state.to_string())
    }
}

/// Digest of a token pair; identifies a pooled document.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey([u8; 32]);

impl PoolKey {
    pub fn of(static_state: &str, dynamic_state: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(static_state.as_bytes());
        hasher.update(&[0]);
        hasher.update(dynamic_state.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolKey({self})")
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Fresh opaque id for a session store entry.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tokens_round_trip_through_text() {
        let token = StateToken::parse("session:abc");
        assert_eq!(token, StateToken::session("abc"));
        assert_eq!(token.to_string(), "session:abc");
        assert_eq!(StateToken::parse("v1.xyz.00"), StateToken::Inline("v1.xyz.00".into()));
    }

    #[test]
    fn mixed_modes_are_rejected() {
        assert!(matches!(
            TokenPair::parse("session:a", "v1.blob.hash"),
            Err(StateError::InconsistentTokens)
        ));
        assert!(TokenPair::parse("session:a", "session:b").is_ok());
    }

    #[test]
    fn pool_keys_depend_on_both_halves() {
        let a = TokenPair::parse("session:s", "session:d1").unwrap().pool_key();
        let b = TokenPair::parse("session:s", "session:d2").unwrap().pool_key();
        assert_ne!(a, b);
        assert_eq!(a, PoolKey::of("session:s", "session:d1"));
        assert_eq!(a.to_string().len(), 12);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
