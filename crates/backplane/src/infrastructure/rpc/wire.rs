//! JSON-lines frames exchanged with the RPC router.
//!
//! One JSON object per line, discriminated by `"type"`:
//!
//! ```text
//! → {"type":"hello","realm":"r1"}
//! ← {"type":"welcome","session":17}
//! → {"type":"call","request":1,"procedure":"add","args":[1,2],"kwargs":{}}
//! ← {"type":"result","request":1,"args":[3],"kwargs":{}}
//! → {"type":"register","request":2,"pattern":"alpha/","match":"prefix"}
//! ← {"type":"registered","request":2,"registration":5}
//! ← {"type":"invocation","request":40,"registration":5,"procedure":"alpha/add","args":[],"kwargs":{}}
//! → {"type":"yield","request":40,"args":[],"kwargs":{}}
//! ```
//!
//! `error` answers any request (`call`, `register`, `unregister`) and also
//! fails an `invocation` in the other direction.

use serde::{Deserialize, Serialize};

use crate::application::rpc::{Args, KwArgs, MatchMode, Registration, RpcError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        realm: String,
    },
    Welcome {
        session: u64,
    },
    Abort {
        message: String,
    },
    Call {
        request: u64,
        procedure: String,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: KwArgs,
    },
    Result {
        request: u64,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: KwArgs,
    },
    Error {
        request: u64,
        message: String,
    },
    Register {
        request: u64,
        pattern: String,
        #[serde(rename = "match")]
        mode: MatchMode,
    },
    Registered {
        request: u64,
        registration: Registration,
    },
    Unregister {
        request: u64,
        registration: Registration,
    },
    Unregistered {
        request: u64,
    },
    Invocation {
        request: u64,
        registration: Registration,
        /// Originally addressed procedure; routers may omit it.
        #[serde(default)]
        procedure: Option<String>,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: KwArgs,
    },
    Yield {
        request: u64,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        kwargs: KwArgs,
    },
}

impl WireMessage {
    /// Request id of a reply to one of our requests.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            WireMessage::Result { request, .. }
            | WireMessage::Error { request, .. }
            | WireMessage::Registered { request, .. }
            | WireMessage::Unregistered { request } => Some(*request),
            _ => None,
        }
    }
}

/// Serializes `message` as one newline-terminated line.
pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, RpcError> {
    let mut line = serde_json::to_vec(message).map_err(|e| RpcError::Protocol(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_frame(line: &str) -> Result<WireMessage, RpcError> {
    serde_json::from_str(line).map_err(|e| RpcError::Protocol(format!("{e}: {line}")))
}
