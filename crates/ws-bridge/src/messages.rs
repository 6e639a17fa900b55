use ntrip_proto::Credentials;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Default caster port for plain TCP.
pub const DEFAULT_NTRIP_PORT: u16 = 2101;
/// Default caster port when TLS is requested.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// A control message sent by the browser client.
///
/// Anything that does not deserialize into one of these variants is dropped
/// by the session without a reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Open (or reopen) the caster connection.
    Connect(ConnectRequest),

    /// A position sentence to forward upstream. Older clients send it as
    /// `gga`.
    #[serde(alias = "gga")]
    Report { sentence: String },

    /// Drop the caster connection but keep the WebSocket open.
    Disconnect,
}

impl ClientMessage {
    /// Parse one text frame. Returns `None` for malformed JSON, unknown
    /// `type` values, missing fields, or a connect without host/mountpoint.
    pub fn parse(text: &str) -> Option<Self> {
        let msg = serde_json::from_str::<ClientMessage>(text).ok()?;
        match &msg {
            ClientMessage::Connect(req) if !req.is_complete() => None,
            _ => Some(msg),
        }
    }
}

/// Caster target requested by a `connect` message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<u16>,
    pub mountpoint: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub ssl: bool,
}

impl ConnectRequest {
    /// Host and mountpoint end up in the request line and `Host` header, so
    /// both must be non-empty single tokens.
    fn is_complete(&self) -> bool {
        is_request_token(self.host()) && is_request_token(self.mountpoint.trim_start_matches('/'))
    }

    pub fn host(&self) -> &str {
        self.host.trim()
    }

    /// Requested port, or the protocol default when none was given.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.ssl {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_NTRIP_PORT
        })
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.user
            .as_deref()
            .filter(|user| !user.is_empty())
            .map(|user| Credentials::new(user, self.password.as_deref()))
    }
}

fn is_request_token(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Accepts a number or a numeric string. Zero, out of range and anything
/// else become `None` so the protocol default applies.
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let port = match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    Ok(port.filter(|p| *p != 0))
}

/// Truthiness in the loose sense browser clients use.
fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        Some(Value::Null) | None => false,
    })
}

/// Upstream lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

/// A JSON control message sent to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Status { message: SessionStatus },
    Error { message: String },
}

impl ServerMessage {
    pub fn status(status: SessionStatus) -> Self {
        ServerMessage::Status { message: status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Encode as a WebSocket text frame.
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(Message::Text(json.into()))
    }
}
