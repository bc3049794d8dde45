//! Identifiers and closed enums shared by the broker, the API, and the wire.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Client ids ────────────────────────────────────────────────────────────────

/// Broker-allocated identifier for one connection. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

// ── Random 16-byte ids ────────────────────────────────────────────────────────

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            /// Fresh random id.
            pub fn generate() -> Self {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse a 32-character hex string.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let arr: [u8; 16] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s)
                    .ok_or_else(|| serde::de::Error::custom("expected 32 hex characters"))
            }
        }
    };
}

hex_id!(
    /// Identifier of one sandboxed session.
    SessionId
);

hex_id!(
    /// Identifier embedded in the signed payload of an invite token.
    TokenId
);

// ── Invite scope ──────────────────────────────────────────────────────────────

/// What an invite token grants.
///
/// Both scopes admit immediately when the slot is free and otherwise place the
/// holder ahead of every plain client, behind earlier token holders. `Direct`
/// is additionally exempt from the queue ceiling. Neither preempts a running
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteScope {
    Bypass,
    Direct,
}

impl InviteScope {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Bypass => 0x01,
            Self::Direct => 0x02,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Bypass),
            0x02 => Some(Self::Direct),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Direct => "direct",
        }
    }
}

impl std::str::FromStr for InviteScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bypass" => Ok(Self::Bypass),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown invite scope '{}'", other)),
        }
    }
}

// ── End reasons and error kinds ───────────────────────────────────────────────

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ClientEnded,
    Timeout,
    Error,
    QueueAborted,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientEnded => "client_ended",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::QueueAborted => "queue_aborted",
        }
    }
}

/// Reason codes carried by `ServerEvent::Error`.
///
/// `RateLimited` and `QueueFull` mean "try again later", `InvalidToken` means
/// the token itself is unusable, the rest describe the end of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    InvalidToken,
    QueueFull,
    SpawnFailed,
    SessionTimeout,
    SandboxCrash,
    ChannelDisconnected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::InvalidToken => "invalid_token",
            Self::QueueFull => "queue_full",
            Self::SpawnFailed => "spawn_failed",
            Self::SessionTimeout => "session_timeout",
            Self::SandboxCrash => "sandbox_crash",
            Self::ChannelDisconnected => "channel_disconnected",
        }
    }

    /// True when the client may simply retry later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::QueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_hex_roundtrip() {
        let id = SessionId::generate();
        assert_eq!(SessionId::from_hex(&id.to_hex()), Some(id));
        assert!(SessionId::from_hex("zz").is_none());
        assert!(SessionId::from_hex("abcd").is_none());
    }

    #[test]
    fn session_id_serializes_as_hex_string() {
        let id = SessionId([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
    }

    #[test]
    fn scope_parses_from_str() {
        assert_eq!("bypass".parse::<InviteScope>(), Ok(InviteScope::Bypass));
        assert_eq!("direct".parse::<InviteScope>(), Ok(InviteScope::Direct));
        assert!("vip".parse::<InviteScope>().is_err());
    }

    #[test]
    fn scope_byte_encoding_is_stable() {
        for scope in [InviteScope::Bypass, InviteScope::Direct] {
            assert_eq!(InviteScope::from_u8(scope.as_u8()), Some(scope));
        }
        assert_eq!(InviteScope::from_u8(0), None);
    }

    #[test]
    fn only_capacity_errors_are_retryable() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::QueueFull.is_retryable());
        assert!(!ErrorKind::InvalidToken.is_retryable());
        assert!(!ErrorKind::SessionTimeout.is_retryable());
    }
}
