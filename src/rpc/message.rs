//! Wire envelopes exchanged between RPC client and server: the request
//! (`RpcInfo`) and its reply (`ResultInfo`). Grounded in the original
//! substrate's `RPCInfo`/`ResultInfo` structs, which travel as the body of a
//! transport message rather than as transport framing themselves.

use crate::codec::Arg;
use crate::error::{MeshError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single RPC request as it appears on the wire. Arguments travel as two
/// parallel arrays (`args_type[]`/`args[][]byte`) rather than a single list
/// of tagged pairs, matching the original substrate's envelope shape; the
/// invariant `len(args_type) == len(args)` is enforced by
/// [`RpcInfo::decode_args`] rather than trusted on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcInfo {
    /// Correlation id matching this request to its `ResultInfo`.
    pub cid: String,
    #[serde(rename = "fn")]
    pub method: String,
    /// Subject/inbox the reply should be published to.
    pub reply_to: String,
    /// Absolute deadline (Unix millis) after which the server should not
    /// bother dispatching or the client should stop waiting.
    pub expired: i64,
    pub reply: bool,
    pub args_type: Vec<String>,
    pub args: Vec<Vec<u8>>,
    /// Node id of the caller, carried for diagnostics and `AppHandle`-level
    /// routing decisions rather than reply delivery (that's `reply_to`'s job).
    pub caller: String,
    /// Hostname of the machine the caller is running on, copied from the
    /// caller's own [`crate::registry::Node`] metadata.
    pub hostname: String,
}

impl RpcInfo {
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn is_expired(&self) -> bool {
        Self::now_millis() > self.expired
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.expired).unwrap_or_else(Utc::now)
    }

    /// Split a `Vec<Arg>` into the wire's parallel `args_type`/`args` arrays.
    pub fn encode_args(args: &[Arg]) -> (Vec<String>, Vec<Vec<u8>>) {
        args.iter().map(|a| (a.tag.clone(), a.bytes.clone())).unzip()
    }

    /// Reassemble `args_type`/`args` back into `Arg`s, rejecting a length
    /// mismatch as a malformed envelope rather than silently truncating.
    pub fn decode_args(&self) -> Result<Vec<Arg>> {
        if self.args_type.len() != self.args.len() {
            return Err(MeshError::codec(format!(
                "args_type/args length mismatch: {} vs {}",
                self.args_type.len(),
                self.args.len()
            )));
        }
        Ok(self
            .args_type
            .iter()
            .cloned()
            .zip(self.args.iter().cloned())
            .map(|(tag, bytes)| Arg::new(tag, bytes))
            .collect())
    }
}

/// The reply to an `RpcInfo`, or an out-of-band error delivered to a
/// listener hook (`OnError`/`OnTimeOut`) without a matching request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfo {
    pub cid: String,
    pub result_type: String,
    pub result: Vec<u8>,
    pub error: Option<String>,
    pub method: String,
    pub exec_time: i64,
}

impl ResultInfo {
    pub fn ok(cid: impl Into<String>, method: impl Into<String>, result: Arg, exec_time: i64) -> Self {
        Self {
            cid: cid.into(),
            result_type: result.tag,
            result: result.bytes,
            error: None,
            method: method.into(),
            exec_time,
        }
    }

    pub fn err(cid: impl Into<String>, method: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            result_type: String::new(),
            result: Vec::new(),
            error: Some(error.into()),
            method: method.into(),
            exec_time: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The successful result as an `Arg`, or `None` if this reply carries
    /// an error instead.
    pub fn into_arg(self) -> Option<Arg> {
        self.is_ok().then(|| Arg::new(self.result_type, self.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_info_ok_has_no_error() {
        let r = ResultInfo::ok("c1", "m", Arg::new("int", vec![]), 5);
        assert!(r.is_ok());
    }

    #[test]
    fn result_info_err_has_no_result() {
        let r = ResultInfo::err("c1", "m", "boom");
        assert!(!r.is_ok());
        assert!(r.into_arg().is_none());
    }

    fn info(args_type: Vec<String>, args: Vec<Vec<u8>>, expired: i64) -> RpcInfo {
        RpcInfo {
            cid: "c".into(),
            method: "m".into(),
            reply_to: "mesh.rpc.reply.node-a".into(),
            expired,
            reply: true,
            args_type,
            args,
            caller: "node-a".into(),
            hostname: "host-a".into(),
        }
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let info = info(vec![], vec![], RpcInfo::now_millis() - 1000);
        assert!(info.is_expired());
    }

    #[test]
    fn decode_args_round_trips_encode_args() {
        let args = vec![3i32.to_be_bytes().to_vec()];
        let (args_type, args) = (vec!["int".to_string()], args);
        let info = info(args_type, args, RpcInfo::now_millis() + 1000);
        let decoded = info.decode_args().unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].tag, "int");
    }

    #[test]
    fn decode_args_rejects_length_mismatch() {
        let info = info(vec!["int".to_string(), "bool".to_string()], vec![vec![0, 0, 0, 1]], RpcInfo::now_millis() + 1000);
        let err = info.decode_args().unwrap_err();
        assert!(matches!(err, MeshError::Codec(_)));
    }
}
