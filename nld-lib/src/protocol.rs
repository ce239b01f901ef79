//! Wire-level message types and protocol constants for the NLD UDP control
//! protocol.
//!
//! Mirrors `ganeti_nbma/constants.py` and the request/reply shape of
//! `nld_nld.py`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current (and only) protocol version this daemon speaks.
pub const NLD_PROTOCOL_VERSION: u8 = 1;

/// Magic fourcc prepended to every UDP datagram.
pub const NLD_MAGIC_FOURCC: &[u8; 4] = b"plj0";

/// How many seconds of clock skew between a request's salt and our own
/// clock we tolerate before rejecting it.
pub const NLD_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// How long a pending client request is tracked before it is expired.
pub const NLD_CLIENT_EXPIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default UDP port this daemon listens on. Not specified by name in
/// spec.md's source material; chosen adjacent to Ganeti confd's well-known
/// `1814` without colliding with it (open question, recorded in DESIGN.md).
pub const NLD_DEFAULT_PORT: u16 = 1816;

/// A request type understood by the request processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Ping,
    RouteInvalidate,
}

impl RequestType {
    pub const ALL: [RequestType; 2] = [RequestType::Ping, RequestType::RouteInvalidate];

    pub fn as_u8(self) -> u8 {
        match self {
            RequestType::Ping => 0,
            RequestType::RouteInvalidate => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Ping),
            1 => Some(RequestType::RouteInvalidate),
            _ => None,
        }
    }
}

/// Status carried in a [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    NotImplemented,
}

impl ReplyStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::Error => 1,
            ReplyStatus::NotImplemented => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReplyStatus::Ok),
            1 => Some(ReplyStatus::Error),
            2 => Some(ReplyStatus::NotImplemented),
            _ => None,
        }
    }
}

/// A request as it appears on the wire, inside the signed envelope.
///
/// `kind` and `status`-like fields travel as raw integers on the wire since
/// an out-of-range value must be rejected by the request processor rather
/// than by serde, matching the original's "wrong request type %d" error
/// path rather than a hard deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub protocol: u8,
    #[serde(rename = "type")]
    pub kind: u8,
    pub rsalt: String,
    pub cluster: String,
    pub is_request: bool,
    #[serde(default)]
    pub query: Value,
}

impl Request {
    pub fn new(kind: RequestType, cluster: impl Into<String>, query: Value) -> Self {
        Request {
            protocol: NLD_PROTOCOL_VERSION,
            kind: kind.as_u8(),
            rsalt: make_salt(),
            cluster: cluster.into(),
            is_request: true,
            query,
        }
    }

    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_u8(self.kind)
    }
}

/// A reply as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub protocol: u8,
    pub is_request: bool,
    pub status: u8,
    pub answer: Value,
    /// Added to the dict at pack time; present on replies we receive, absent
    /// until [`crate::codec`] fills it in for replies we send.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cluster: Option<String>,
}

impl Reply {
    pub fn new(status: ReplyStatus, answer: Value) -> Self {
        Reply {
            protocol: NLD_PROTOCOL_VERSION,
            is_request: false,
            status: status.as_u8(),
            answer,
            cluster: None,
        }
    }

    pub fn reply_status(&self) -> Option<ReplyStatus> {
        ReplyStatus::from_u8(self.status)
    }
}

/// Builds a fresh `rsalt`: a random token with no embedded clock, used only
/// to correlate an outbound request with its reply (the responder echoes it
/// back verbatim as the reply's outer wire salt). Distinct from the outer
/// wire salt of a request itself, which is a decimal timestamp — see
/// [`timestamp_salt`].
pub fn make_salt() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Builds the outer wire salt for an outbound request: the current Unix
/// time in seconds formatted as a decimal integer (spec.md §4.C/§6), which
/// the receiver checks against its own clock.
pub fn timestamp_salt() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    secs.to_string()
}

/// Parses a decimal-timestamp outer salt (see [`timestamp_salt`]) back into
/// a Unix timestamp; returns `None` if it is not a bare decimal integer.
pub fn salt_timestamp(salt: &str) -> Option<u64> {
    salt.parse().ok()
}

/// Minimal view used only to read the `is_request` discriminator before
/// committing to a full [`Request`]/[`Reply`] parse.
#[derive(Debug, Deserialize)]
pub struct Discriminator {
    pub is_request: Option<bool>,
    pub cluster: Option<String>,
}
