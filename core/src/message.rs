//! Wire message shapes (§6).
//!
//! `Message` stands in for the spec's `packed_any`: a tagged, versioned
//! enum carrying the handler payload, serialized with `bincode` on the
//! binary frame path and with `serde_json` on the HTTP fallback path. It
//! is deliberately open (new variants can be added) rather than a fixed
//! protobuf schema, since no `.proto` schema is in scope for this crate.

use serde::{Deserialize, Serialize};

/// The three top-level request kinds a client may submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_type")]
pub enum Command {
    ClientCommand { command: Message, blocking: bool },
    Poll { queue_id: u64, timeout_ms: u64, max_count: usize },
    Shutdown,
    /// Sent as the first message on either connection to discover (and,
    /// when `bind_queue_id` is absent, allocate) the caller's queue-id.
    /// The command connection sends this with `bind_queue_id: None` and
    /// gets a freshly allocated queue-id back; the poll connection then
    /// sends it with `bind_queue_id: Some(that id)` to join the same
    /// queue rather than getting one of its own (spec.md §4.3's
    /// "share a queue-id" requirement).
    GetSystemState { bind_queue_id: Option<u64> },
}

/// A response envelope. `body` carries one of the three shapes below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResponseBody {
    RunCommandAck { queue_id: u64, task_id: u64 },
    PollResults { results: Vec<CommandResult> },
    SystemState { queue_id: u64 },
    TextResponse { message: String },
}

impl Response {
    pub fn ok(body: ResponseBody) -> Response {
        Response { code: ResponseCode::Ok, body }
    }

    pub fn error(message: impl Into<String>) -> Response {
        Response {
            code: ResponseCode::Error,
            body: ResponseBody::TextResponse { message: message.into() },
        }
    }
}

/// The result of one completed command, as delivered through a poll call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub task_id: u64,
    pub result: Option<Message>,
    pub result_code: ResultCode,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    None,
    Ok,
    Error,
}

/// The typed payload carried by a `Command` and by a `CommandResult`.
///
/// Handlers match on the variant they were registered against; the command
/// registry (`command::registry`) dispatches purely on the variant's name,
/// matching spec.md's "message-type-name -> handler" registry contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    StoreValue { key: String, value: String },
    StoreValueResult { result: String },
    GetValue { key: String },
    GetValueResult { value: String },
    InstallHook { name: String, address: usize, prefix_length: usize },
    AddCallback { target: usize, name: String },
    RemoveCallback { target: usize, name: String },
    UninstallHook { target: usize },
    UnitOrder { addresses: Vec<u32>, action: String, x: f32, y: f32 },
    Ack,
}

impl Message {
    /// The registry key this payload dispatches under. Mirrors the
    /// source's string-keyed registry while keeping the payload itself
    /// typed (spec.md §9's re-architecture note).
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::StoreValue { .. } => "StoreValue",
            Message::StoreValueResult { .. } => "StoreValueResult",
            Message::GetValue { .. } => "GetValue",
            Message::GetValueResult { .. } => "GetValueResult",
            Message::InstallHook { .. } => "InstallHook",
            Message::AddCallback { .. } => "AddCallback",
            Message::RemoveCallback { .. } => "RemoveCallback",
            Message::UninstallHook { .. } => "UninstallHook",
            Message::UnitOrder { .. } => "UnitOrder",
            Message::Ack => "Ack",
        }
    }
}

/// Encode a value for the binary frame body.
pub fn encode<T: Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a value from a binary frame body.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> crate::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let cmd = Command::ClientCommand {
            command: Message::StoreValue { key: "k".into(), value: "v".into() },
            blocking: false,
        };
        let bytes = encode(&cmd).unwrap();
        let back: Command = decode(&bytes).unwrap();
        match back {
            Command::ClientCommand { command: Message::StoreValue { key, value }, .. } => {
                assert_eq!(key, "k");
                assert_eq!(value, "v");
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let resp = Response::ok(ResponseBody::RunCommandAck { queue_id: 1, task_id: 2 });
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ResponseCode::Ok);
    }
}
