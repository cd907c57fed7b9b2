use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound action requesting the exchange list.
pub const LIST_EXCHANGES_ACTION: &str = "list-exchanges";
/// Inbound action carrying the exchange list.
pub const EXCHANGES_ACTION: &str = "exchanges";

/// Client-to-server message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub action: String,
    pub data: Value,
}

impl OutboundMessage {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }

    pub fn list_exchanges() -> Self {
        Self::new(LIST_EXCHANGES_ACTION, Value::Null)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server-to-client message envelope.
///
/// `data` defaults to `null` when the server omits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decodes `data` into a typed payload.
    pub fn decode_data<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        T::deserialize(&self.data)
    }
}

/// Exchange record published under [`EXCHANGES_ACTION`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeMsg {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markets: Vec<Value>,
}
