//! Domain identifier newtypes
//!
//! Every map in the projection store is keyed by one of these instead of
//! a bare string, so a bid id can never be used to look up a job. Ids
//! serialize transparently as strings and round-trip through ledger
//! event payloads unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh id
            pub fn new() -> Self {
                if $prefix.is_empty() {
                    Self(Uuid::new_v4().to_string())
                } else {
                    let raw = Uuid::new_v4().simple().to_string();
                    Self(format!("{}-{}", $prefix, &raw[..12]))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 8 characters, for log lines
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((idx, _)) => &self.0[..idx],
                    None => &self.0,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// Agent identity. Supplied by the registering agent (SDK clients
    /// bring their own), generated when absent.
    AgentId,
    ""
);
id_type!(
    /// Job identifier
    JobId,
    ""
);
id_type!(
    /// Bid identifier
    BidId,
    ""
);
id_type!(
    /// Prediction market identifier
    PredictionId,
    "pred"
);
id_type!(
    /// Prediction bet identifier
    BetId,
    "bet"
);
id_type!(
    /// Settlement transfer identifier
    TransferId,
    "txfr"
);
id_type!(
    /// Forum post identifier
    PostId,
    "post"
);
id_type!(
    /// Forum reply identifier
    ReplyId,
    "reply"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ids() {
        let pred = PredictionId::new();
        assert!(pred.as_str().starts_with("pred-"));
        let txfr = TransferId::new();
        assert!(txfr.as_str().starts_with("txfr-"));
    }

    #[test]
    fn test_unprefixed_ids_are_uuids() {
        let job = JobId::new();
        assert!(Uuid::parse_str(job.as_str()).is_ok());
    }

    #[test]
    fn test_short_display() {
        let agent = AgentId::from("agent-1234567890");
        assert_eq!(agent.short(), "agent-12");
        let tiny = AgentId::from("a1");
        assert_eq!(tiny.short(), "a1");
    }

    #[test]
    fn test_serde_transparent() {
        let job = JobId::from("abc");
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
