//! Wire protocol shared by the bridge's client-facing socket and the
//! internal worker/proxy sync channel.

use serde::{Deserialize, Serialize};

/// A request frame received on the bridge's listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Commands that require the requesting peer to be uid 0: `CHECKPOINT`,
/// `SCAN`, `DBDUMP`, `DBSTATS`, `RESOURCES`. Checked against `SO_PEERCRED`
/// by the bridge before
/// dispatch. `DBRESTORE` is this crate's own name for the load half of the
/// `persistence` feature and is held to the same bar as `DBDUMP`.
pub const PRIVILEGED_COMMANDS: &[&str] =
    &["CHECKPOINT", "SCAN", "DBDUMP", "DBRESTORE", "DBSTATS", "RESOURCES"];

impl Request {
    pub fn is_privileged(&self) -> bool {
        PRIVILEGED_COMMANDS.contains(&self.command.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
    ExpectingData,
    ExpectingExpbufAck,
}

/// A response frame, mirroring the command state machine's outward-visible
/// states: a command either completes, fails, or asks for more from
/// the client before it can complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: Status::Ok, body, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: Status::Error, body: Vec::new(), error: Some(message.into()) }
    }
}

/// Which part of the resource tree an internal sync message concerns:
/// entries the worker owns outright, entries shared with the rest of the
/// device's own namespace, or entries destined for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncCategory {
    System,
    SelfDevice,
    Client,
}

/// One internal sync message: the category it belongs to, and the raw
/// export-buffer byte range (offset/len into the accompanying memfd) that
/// carries its serialized KV records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub category: SyncCategory,
    pub offset: u64,
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_commands_are_recognized() {
        let req = Request { command: "DBDUMP".into(), args: vec![], payload: vec![] };
        assert!(req.is_privileged());
        let req = Request { command: "VERSION".into(), args: vec![], payload: vec![] };
        assert!(!req.is_privileged());
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = Request { command: "SET".into(), args: vec!["8_0".into()], payload: vec![1, 2, 3] };
        let encoded = serde_json::to_vec(&req).unwrap();
        let decoded: Request = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.command, req.command);
        assert_eq!(decoded.payload, req.payload);
    }
}
