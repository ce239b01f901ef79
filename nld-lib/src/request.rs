//! Server-side request dispatch: validates an inbound [`Request`] and
//! produces a [`Reply`], grounded on `nld_nld.py::NLDRequestProcessor`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::protocol::{salt_timestamp, Reply, ReplyStatus, Request, RequestType, NLD_MAX_CLOCK_SKEW};

/// `NLD_ERROR_ARGUMENT` from the original constants module: the answer code
/// for a `ROUTE_INVALIDATE` sent with no query body.
const NLD_ERROR_ARGUMENT: i64 = 3;

/// Python-style truthiness for a JSON query body: `None`, `false`, `0`, an
/// empty string, array or object are all "empty".
fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported protocol version {0}")]
    BadProtocolVersion(u8),
    #[error("not a request datagram")]
    NotARequest,
    #[error("unknown request type {0}")]
    UnknownRequestType(u8),
    #[error("request salt is malformed")]
    MalformedSalt,
    #[error("request salt is outside the tolerated clock skew")]
    ClockSkew,
    #[error("cluster {0:?} is not served by this node")]
    UnknownCluster(String),
}

/// Invoked once per accepted `ROUTE_INVALIDATE` request, before the reply is
/// built, so the reconciler can force an immediate oracle refresh.
pub trait InvalidationHandler: Send + Sync {
    fn invalidate(&self, cluster: &str);
}

pub struct RequestProcessor<'a> {
    /// Clusters this node actually serves; a request for anything else is
    /// rejected rather than answered.
    pub known_clusters: &'a [String],
    pub invalidation: &'a dyn InvalidationHandler,
}

impl<'a> RequestProcessor<'a> {
    pub fn new(known_clusters: &'a [String], invalidation: &'a dyn InvalidationHandler) -> Self {
        RequestProcessor { known_clusters, invalidation }
    }

    /// Validates and dispatches `request`, returning the reply to send back.
    /// `outer_salt` is the datagram's outer wire salt (a decimal Unix
    /// timestamp for a request, per spec.md §4.C/§6), distinct from the
    /// inner `request.rsalt` correlation token. Validation order matches the
    /// original: protocol version, request type, clock skew, then cluster
    /// membership, before any handler runs.
    pub fn process(&self, request: &Request, outer_salt: &str) -> Result<Reply, Error> {
        self.validate(request, outer_salt)?;
        let kind = request.request_type().ok_or(Error::UnknownRequestType(request.kind))?;
        let (status, answer) = match kind {
            RequestType::Ping => self.handle_ping(&request.query),
            RequestType::RouteInvalidate => self.handle_route_invalidate(request),
        };
        Ok(Reply::new(status, answer))
    }

    fn validate(&self, request: &Request, outer_salt: &str) -> Result<(), Error> {
        if !request.is_request {
            return Err(Error::NotARequest);
        }
        if request.protocol != crate::protocol::NLD_PROTOCOL_VERSION {
            return Err(Error::BadProtocolVersion(request.protocol));
        }
        if request.request_type().is_none() {
            return Err(Error::UnknownRequestType(request.kind));
        }
        let ts = salt_timestamp(outer_salt).ok_or(Error::MalformedSalt)?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let skew = now.abs_diff(ts);
        if skew > NLD_MAX_CLOCK_SKEW.as_secs() {
            return Err(Error::ClockSkew);
        }
        if !self.known_clusters.iter().any(|c| c == &request.cluster) {
            return Err(Error::UnknownCluster(request.cluster.clone()));
        }
        Ok(())
    }

    /// Empty (`null`) query is the only valid ping; anything else is an
    /// error, matching the original's `query is None` check exactly (not
    /// general falsy-ness, unlike `_RouteInvalidate`).
    fn handle_ping(&self, query: &Value) -> (ReplyStatus, Value) {
        if query.is_null() {
            (ReplyStatus::Ok, Value::String("ok".to_string()))
        } else {
            (ReplyStatus::Error, Value::String("non-empty ping query".to_string()))
        }
    }

    fn handle_route_invalidate(&self, request: &Request) -> (ReplyStatus, Value) {
        if is_falsy(&request.query) {
            return (ReplyStatus::Error, Value::Number(NLD_ERROR_ARGUMENT.into()));
        }
        self.invalidation.invalidate(&request.cluster);
        (ReplyStatus::Ok, Value::String("done".to_string()))
    }
}
