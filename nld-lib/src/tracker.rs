//! Tracks outbound requests awaiting a reply, expires ones that time out,
//! and delivers REPLY/EXPIRE upcalls. Grounded on `nld_nld.py`'s
//! `SendRequest`/`ExpireRequests`/`HandleResponse`/`NLDUpcallPayload`.
//!
//! Holds only a callback closure, never a reference back to whatever owns
//! the reconciler, so there is no cyclic ownership between tracker and
//! reconciler (spec §9).

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde_json::Value;

use crate::codec;
use crate::protocol::{self, Reply, Request, RequestType, NLD_CLIENT_EXPIRE_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no signing key registered for cluster {0:?}")]
    UnknownCluster(String),
    #[error(transparent)]
    Codec(#[from] codec::Error),
}

/// Delivered to the tracker's callback when a reply arrives or a pending
/// request times out.
#[derive(Debug, Clone)]
pub enum Upcall {
    Reply { cluster: String, rsalt: String, answer: Value },
    Expired { cluster: String, rsalt: String },
}

struct Pending {
    cluster: String,
    deadline: Instant,
}

/// Tracks requests this node has sent and is awaiting a reply for. Does not
/// own the transport: [`Self::send`] returns the bytes to enqueue, keeping
/// the tracker free of socket concerns.
pub struct Tracker {
    cluster_keys: HashMap<String, Vec<u8>>,
    pending: HashMap<String, Pending>,
    expire_queue: VecDeque<(Instant, String)>,
    on_upcall: Box<dyn FnMut(Upcall) + Send>,
}

impl Tracker {
    pub fn new(
        cluster_keys: HashMap<String, Vec<u8>>,
        on_upcall: Box<dyn FnMut(Upcall) + Send>,
    ) -> Self {
        Tracker {
            cluster_keys,
            pending: HashMap::new(),
            expire_queue: VecDeque::new(),
            on_upcall,
        }
    }

    /// Signs and frames `kind`/`query` for `cluster`, registers it as
    /// pending, and returns the datagram bytes to send to `dest`.
    pub fn send(
        &mut self,
        cluster: &str,
        kind: RequestType,
        query: Value,
    ) -> Result<Vec<u8>, Error> {
        let key = self
            .cluster_keys
            .get(cluster)
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))?;
        let request = Request::new(kind, cluster, query);
        // The outer salt is a decimal timestamp for clock-skew checking,
        // distinct from `rsalt`: the responder echoes `rsalt` back as the
        // reply's outer salt, which is how we correlate the reply below.
        let bytes = codec::pack(&request, key, &protocol::timestamp_salt());

        let deadline = Instant::now() + NLD_CLIENT_EXPIRE_TIMEOUT;
        self.pending.insert(
            request.rsalt.clone(),
            Pending { cluster: cluster.to_string(), deadline },
        );
        self.expire_queue.push_back((deadline, request.rsalt));
        Ok(bytes)
    }

    /// Matches an inbound reply against a pending request by the outer
    /// salt the responder echoed back (which equals the original request's
    /// `rsalt`) and fires the REPLY upcall. Unmatched or already-expired
    /// replies are silently dropped, matching the original's tolerance of
    /// late/stray replies.
    pub fn handle_reply(&mut self, echoed_salt: &str, reply: Reply) {
        if let Some(pending) = self.pending.remove(echoed_salt) {
            (self.on_upcall)(Upcall::Reply {
                cluster: pending.cluster,
                rsalt: echoed_salt.to_string(),
                answer: reply.answer,
            });
        }
    }

    /// Keys into [`Self::cluster_keys`] for verifying/signing a reply whose
    /// salt is still pending, if any.
    pub fn key_for(&self, cluster: &str) -> Option<&[u8]> {
        self.cluster_keys.get(cluster).map(|k| k.as_slice())
    }

    /// Pops every pending request whose deadline has passed and fires an
    /// EXPIRE upcall for each. `expire_queue` entries are inserted in
    /// non-decreasing deadline order (the timeout is constant), so an O(1)
    /// pop-front-while-due purge is sufficient.
    pub fn expire_due(&mut self, now: Instant) {
        while let Some((deadline, _)) = self.expire_queue.front() {
            if *deadline > now {
                break;
            }
            let (_, rsalt) = self.expire_queue.pop_front().unwrap();
            if let Some(pending) = self.pending.remove(&rsalt) {
                (self.on_upcall)(Upcall::Expired { cluster: pending.cluster, rsalt });
            }
        }
    }

    /// The earliest deadline still pending, used by the main loop to size
    /// its next `sleep_until`.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expire_queue.front().map(|(d, _)| *d)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReplyStatus, RequestType};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn tracker_with_recorder() -> (Tracker, Arc<Mutex<Vec<Upcall>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        let mut keys = HashMap::new();
        keys.insert("prod".to_string(), b"key".to_vec());
        let tracker = Tracker::new(
            keys,
            Box::new(move |upcall| recorder.lock().unwrap().push(upcall)),
        );
        (tracker, received)
    }

    #[test]
    fn send_registers_a_pending_request() {
        let (mut tracker, _) = tracker_with_recorder();
        tracker.send("prod", RequestType::Ping, Value::Null).unwrap();
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn send_rejects_unknown_cluster() {
        let (mut tracker, _) = tracker_with_recorder();
        let err = tracker.send("staging", RequestType::Ping, Value::Null).unwrap_err();
        assert!(matches!(err, Error::UnknownCluster(c) if c == "staging"));
    }

    #[test]
    fn handle_reply_fires_upcall_and_clears_pending() {
        let (mut tracker, received) = tracker_with_recorder();
        let bytes = tracker.send("prod", RequestType::Ping, Value::Null).unwrap();
        let unpacked = codec::unpack(&bytes, |c| {
            if c == "prod" { Some(b"key".as_slice()) } else { None }
        })
        .unwrap();
        let sent: Request = serde_json::from_str(&unpacked.msg).unwrap();

        tracker.handle_reply(&sent.rsalt, Reply::new(ReplyStatus::Ok, Value::Null));
        assert_eq!(tracker.pending_count(), 0);
        let upcalls = received.lock().unwrap();
        assert_eq!(upcalls.len(), 1);
        assert!(matches!(&upcalls[0], Upcall::Reply { cluster, .. } if cluster == "prod"));
    }

    #[test]
    fn expire_due_fires_for_requests_past_their_deadline() {
        let (mut tracker, received) = tracker_with_recorder();
        tracker.send("prod", RequestType::Ping, Value::Null).unwrap();

        tracker.expire_due(Instant::now());
        assert_eq!(tracker.pending_count(), 1, "not due yet");

        tracker.expire_due(Instant::now() + NLD_CLIENT_EXPIRE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(tracker.pending_count(), 0);
        assert!(matches!(received.lock().unwrap()[0], Upcall::Expired { .. }));
    }

    #[test]
    fn unmatched_reply_is_dropped_silently() {
        let (mut tracker, received) = tracker_with_recorder();
        tracker.handle_reply("no-such-salt", Reply::new(ReplyStatus::Ok, Value::Null));
        assert!(received.lock().unwrap().is_empty());
    }
}
