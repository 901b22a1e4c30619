use {
  serde::{
    de,
    ser::SerializeMap,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
  },
  serde_json::Value,
};

/// The JSON-RPC subset spoken between nodes. One JSON object per
/// frame; the set of present keys decides the kind:
///
/// - request: `{"id", "method", "params"}`
/// - response: `{"id", "result"}` or `{"id", "error"}`
/// - notification: `{"method", "params"}`
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  Request {
    id: u64,
    method: String,
    params: Value,
  },
  Response {
    id: u64,
    result: Value,
  },
  Error {
    id: u64,
    error: ErrorBody,
  },
  Notification {
    method: String,
    params: Value,
  },
}

/// The error member of an error response:
/// `{"message": string, "data": any?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl Serialize for Message {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    match self {
      Message::Request { id, method, params } => {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", id)?;
        map.serialize_entry("method", method)?;
        map.serialize_entry("params", params)?;
        map.end()
      }
      Message::Response { id, result } => {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", id)?;
        map.serialize_entry("result", result)?;
        map.end()
      }
      Message::Error { id, error } => {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", id)?;
        map.serialize_entry("error", error)?;
        map.end()
      }
      Message::Notification { method, params } => {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("method", method)?;
        map.serialize_entry("params", params)?;
        map.end()
      }
    }
  }
}

/// Flat view of a decoded frame, before the kind is known.
#[derive(Deserialize)]
struct RawMessage {
  id: Option<u64>,
  method: Option<String>,
  params: Option<Value>,
  result: Option<Value>,
  error: Option<ErrorBody>,
}

impl<'de> Deserialize<'de> for Message {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let raw = RawMessage::deserialize(deserializer)?;
    match (raw.id, raw.method) {
      (Some(id), Some(method)) => Ok(Message::Request {
        id,
        method,
        params: raw.params.unwrap_or(Value::Null),
      }),
      (Some(id), None) => match raw.error {
        Some(error) => Ok(Message::Error { id, error }),
        None => Ok(Message::Response {
          id,
          result: raw.result.unwrap_or(Value::Null),
        }),
      },
      (None, Some(method)) => Ok(Message::Notification {
        method,
        params: raw.params.unwrap_or(Value::Null),
      }),
      (None, None) => {
        Err(de::Error::custom("message carries neither id nor method"))
      }
    }
  }
}
