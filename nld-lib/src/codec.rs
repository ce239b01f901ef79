//! HMAC-signed, magic-framed datagram encoding.
//!
//! Wire layout: `MAGIC || JSON_OUTER` where `JSON_OUTER = {"msg": <inner json
//! string>, "salt": <string>, "hmac": <hex string>}` and `JSON_INNER` is the
//! serialized [`crate::protocol::Request`] or [`crate::protocol::Reply`],
//! which itself carries the `cluster` field used to select the signing key.
//! Grounded on `nld_nld.py`'s `PackMagic`/`UnpackMagic` and Ganeti's
//! `serializer.DumpSigned`/`LoadSigned`.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::protocol::{Discriminator, NLD_MAGIC_FOURCC};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("datagram too short to carry the magic fourcc")]
    Magic,
    #[error("outer envelope is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("inner message is not valid JSON: {0}")]
    InnerDecode(#[source] serde_json::Error),
    #[error("inner message carries no cluster selector")]
    MissingCluster,
    #[error("no signing key registered for cluster {0:?}")]
    UnknownCluster(String),
    #[error("HMAC signature does not match")]
    Signature,
}

#[derive(Debug, Serialize, Deserialize)]
struct OuterFrame {
    msg: String,
    salt: String,
    hmac: String,
}

/// Serializes `inner` to JSON, signs it with `key` under the given `salt`,
/// and wraps the result in the magic-prefixed outer envelope.
pub fn pack(inner: &impl Serialize, key: &[u8], salt: &str) -> Vec<u8> {
    let msg = serde_json::to_string(inner).expect("protocol types always serialize");
    let hmac = sign(key, salt, &msg);
    let outer = OuterFrame { msg, salt: salt.to_string(), hmac };
    let mut out = Vec::with_capacity(4 + 128);
    out.extend_from_slice(NLD_MAGIC_FOURCC);
    out.extend_from_slice(&serde_json::to_vec(&outer).expect("outer frame always serializes"));
    out
}

/// Strips the magic fourcc, parses the outer envelope, extracts the
/// `cluster` selector from the (cleartext, signed) inner message, looks up
/// its key via `key_lookup`, and verifies the HMAC.
pub struct Unpacked {
    /// The raw inner JSON string (a [`crate::protocol::Request`] or
    /// [`crate::protocol::Reply`]).
    pub msg: String,
    /// The cluster that selected the verification key.
    pub cluster: String,
    /// The outer salt: for a reply this equals the original request's
    /// `rsalt`, which is how the client correlates replies to pending
    /// requests (the responder echoes the client's salt back verbatim).
    pub salt: String,
}

pub fn unpack<'a>(
    datagram: &[u8],
    key_lookup: impl Fn(&str) -> Option<&'a [u8]>,
) -> Result<Unpacked, Error> {
    if datagram.len() < NLD_MAGIC_FOURCC.len() || &datagram[..4] != NLD_MAGIC_FOURCC {
        return Err(Error::Magic);
    }
    let outer: OuterFrame = serde_json::from_slice(&datagram[4..]).map_err(Error::Decode)?;
    let discr: Discriminator =
        serde_json::from_str(&outer.msg).map_err(Error::InnerDecode)?;
    let cluster = discr.cluster.ok_or(Error::MissingCluster)?;
    let key = key_lookup(&cluster).ok_or_else(|| Error::UnknownCluster(cluster.clone()))?;
    let expected = sign(key, &outer.salt, &outer.msg);
    if !constant_time_eq(expected.as_bytes(), outer.hmac.as_bytes()) {
        return Err(Error::Signature);
    }
    Ok(Unpacked { msg: outer.msg, cluster, salt: outer.salt })
}

fn sign(key: &[u8], salt: &str, msg: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(salt.as_bytes());
    mac.update(msg.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
