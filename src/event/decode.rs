//! Decoding of coturn statsdb channel names and payloads.
//!
//! coturn publishes allocation events on keys of the form
//! `turn/realm/<realm>/user/<user>/allocation/<id>/<kind>`. Only the
//! `traffic` and `status` kinds feed the exporter; everything else (for
//! example `total_traffic` or per-peer traffic) is reported as unsupported.

use regex::Regex;
use thiserror::Error;

use super::{AllocationKey, AllocationStatus, EventKind, RawMessage, RelayEvent, TrafficSample};

const KEY_PATTERN: &str = r"^(turn/realm/([^/]+)/user/[^/]+/allocation/[^/]+)/(.+)$";
const TRAFFIC_PATTERN: &str = r"rcvp=([0-9]+), rcvb=([0-9]+), sentp=([0-9]+), sentb=([0-9]+)";

/// Errors that can occur while decoding an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected key name: {key}")]
    UnexpectedKey { key: String },

    #[error("unexpected traffic payload: {payload}")]
    UnexpectedTraffic { payload: String },

    #[error("unknown allocation status: {payload}")]
    UnknownStatus { payload: String },

    #[error("unsupported event kind: {kind}")]
    Unsupported { kind: String },
}

impl DecodeError {
    /// Stable label for error counters.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnexpectedKey { .. } => "unexpected_key",
            Self::UnexpectedTraffic { .. } => "unexpected_traffic",
            Self::UnknownStatus { .. } => "unknown_status",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

/// Compiled matchers for keys and traffic payloads.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    key: Regex,
    traffic: Regex,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            key: Regex::new(KEY_PATTERN).expect("key pattern is valid"),
            traffic: Regex::new(TRAFFIC_PATTERN).expect("traffic pattern is valid"),
        }
    }

    /// Splits a channel name into the allocation identity and the sub-key.
    pub fn parse_key<'a>(&self, key: &'a str) -> Result<(AllocationKey, &'a str), DecodeError> {
        let captures = self
            .key
            .captures(key)
            .ok_or_else(|| DecodeError::UnexpectedKey {
                key: key.to_string(),
            })?;

        match (captures.get(1), captures.get(2), captures.get(3)) {
            (Some(name), Some(realm), Some(kind)) => Ok((
                AllocationKey {
                    name: name.as_str().to_string(),
                    realm: realm.as_str().to_string(),
                },
                kind.as_str(),
            )),
            _ => Err(DecodeError::UnexpectedKey {
                key: key.to_string(),
            }),
        }
    }

    /// Parses a `rcvp=N, rcvb=N, sentp=N, sentb=N` payload.
    pub fn parse_traffic(&self, payload: &str) -> Result<TrafficSample, DecodeError> {
        let err = || DecodeError::UnexpectedTraffic {
            payload: payload.to_string(),
        };

        let captures = self.traffic.captures(payload).ok_or_else(err)?;
        let field = |idx: usize| -> Result<u64, DecodeError> {
            captures
                .get(idx)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(err)
        };

        Ok(TrafficSample {
            received_packets: field(1)?,
            received_bytes: field(2)?,
            sent_packets: field(3)?,
            sent_bytes: field(4)?,
        })
    }

    /// Parses a status payload such as `new lifetime=600` or `deleted`.
    pub fn parse_status(&self, payload: &str) -> Result<AllocationStatus, DecodeError> {
        if payload.starts_with("new") {
            Ok(AllocationStatus::New)
        } else if payload.starts_with("refreshed") {
            Ok(AllocationStatus::Refreshed)
        } else if payload == "deleted" {
            Ok(AllocationStatus::Deleted)
        } else {
            Err(DecodeError::UnknownStatus {
                payload: payload.to_string(),
            })
        }
    }

    /// Decodes a transport message into a [`RelayEvent`].
    pub fn decode(&self, message: &RawMessage) -> Result<RelayEvent, DecodeError> {
        let (allocation, kind) = self.parse_key(&message.channel)?;

        let kind = match kind {
            "traffic" => EventKind::Traffic(self.parse_traffic(&message.payload)?),
            "status" => EventKind::Status(self.parse_status(&message.payload)?),
            other => {
                return Err(DecodeError::Unsupported {
                    kind: other.to_string(),
                })
            }
        };

        Ok(RelayEvent { allocation, kind })
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}
