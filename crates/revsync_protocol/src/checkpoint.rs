//! Checkpoint bodies and the peer-checkpoint revision token.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// The persisted sync-progress pair.
///
/// `local` is this side's minimum unreplicated commit sequence; `remote` is
/// the peer's pagination token, stored opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBody {
    /// Minimum unreplicated local sequence.
    #[serde(default)]
    pub local: u64,
    /// Minimum unreplicated remote sequence (opaque token).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote: String,
}

impl CheckpointBody {
    /// Encodes to the JSON wire/storage form.
    pub fn to_json(&self) -> Vec<u8> {
        // Serialization of this shape cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes from the JSON wire/storage form.
    ///
    /// A numeric `remote` field is accepted and stored in its text form.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::invalid_body(e.to_string()))?;
        let map = value
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_body("expected object"))?;
        let local = map.get("local").and_then(|v| v.as_u64()).unwrap_or(0);
        let remote = match map.get("remote") {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(ProtocolError::invalid_body(format!(
                    "unexpected remote sequence {other}"
                )))
            }
        };
        Ok(Self { local, remote })
    }

    /// True if neither side has recorded progress.
    pub fn is_empty(&self) -> bool {
        self.local == 0 && self.remote.is_empty()
    }
}

/// The optimistic-concurrency token on a peer-stored checkpoint, of the
/// form `"{N}-cc"` with a monotonically increasing `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerCheckpointRev(u64);

impl PeerCheckpointRev {
    /// Parses a stored token. The whole token must match `N-cc`.
    pub fn parse(token: &str) -> ProtocolResult<Self> {
        let n = token
            .strip_suffix("-cc")
            .and_then(|n| n.parse::<u64>().ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| ProtocolError::InvalidCheckpointRev {
                token: token.to_string(),
            })?;
        Ok(Self(n))
    }

    /// The first token, for a checkpoint being created.
    pub fn first() -> Self {
        Self(1)
    }

    /// The token following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The generation number.
    pub fn generation(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerCheckpointRev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-cc", self.0)
    }
}
