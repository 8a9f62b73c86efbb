use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{level_filters::LevelFilter, warn};

use crate::{
    error::CoordinationError,
    jsonrpc::{Id, Message, Request},
};

/// What a worker needs to make authenticated calls to the platform.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub auth_token: String,
    pub worker_id: String,
}

impl Credentials {
    pub fn new(auth_token: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Both halves present.
    pub fn is_complete(&self) -> bool {
        !self.auth_token.is_empty() && !self.worker_id.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.auth_token.is_empty() && self.worker_id.is_empty()
    }
}

// never print the token
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = if self.auth_token.is_empty() { "<empty>" } else { "<redacted>" };
        f.debug_struct("Credentials")
            .field("auth_token", &token)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    AsRefStr,
    Display,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase", try_from = "String")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

// accept any casing on the wire, same as the command line
impl TryFrom<String> for LogLevel {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, <LogLevel as TryFrom<String>>::Error> {
        value.parse()
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

// -----------------------------------------------------------------------------
// Coordination messages (master <-> worker)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum CoordinationMethod {
    CredentialUpdateFromWorker,
    CredentialUpdateFromMaster,
    LogLevelUpdateFromWorker,
    LogLevelUpdateFromMaster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevelParams {
    pub level: LogLevel,
}

/// State replicated across the pool. Every variant is idempotent on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationMessage {
    CredentialUpdateFromWorker(Credentials),
    CredentialUpdateFromMaster(Credentials),
    LogLevelUpdateFromWorker(LogLevel),
    LogLevelUpdateFromMaster(LogLevel),
}

impl CoordinationMessage {
    pub fn method(&self) -> CoordinationMethod {
        match self {
            Self::CredentialUpdateFromWorker(_) => CoordinationMethod::CredentialUpdateFromWorker,
            Self::CredentialUpdateFromMaster(_) => CoordinationMethod::CredentialUpdateFromMaster,
            Self::LogLevelUpdateFromWorker(_) => CoordinationMethod::LogLevelUpdateFromWorker,
            Self::LogLevelUpdateFromMaster(_) => CoordinationMethod::LogLevelUpdateFromMaster,
        }
    }

    /// `true` for the variants only the master may send.
    pub fn is_from_master(&self) -> bool {
        matches!(
            self,
            Self::CredentialUpdateFromMaster(_) | Self::LogLevelUpdateFromMaster(_)
        )
    }

    /// Encode as a JSON-RPC notification.
    pub fn to_request(&self) -> Request {
        let params = match self {
            Self::CredentialUpdateFromWorker(creds) | Self::CredentialUpdateFromMaster(creds) => {
                serde_json::to_value(creds)
            }
            Self::LogLevelUpdateFromWorker(level) | Self::LogLevelUpdateFromMaster(level) => {
                serde_json::to_value(LogLevelParams { level: *level })
            }
        };
        // both payloads are plain string structs
        Request::notification(self.method().to_string(), params.ok())
    }

    /// Encode as one newline-terminated line for a stdio channel.
    pub fn to_line(&self) -> String {
        let req = self.to_request();
        match serde_json::to_string(&req) {
            Ok(s) => format!("{s}\n"),
            Err(_) => format!(
                "{{\"jsonrpc\":\"2.0\",\"method\":\"{}\"}}\n",
                req.method
            ),
        }
    }
}

impl CoordinationMessage {
    /// Decode one line read from a coordination channel.
    ///
    /// Blank lines and lines that are not JSON-RPC at all yield `Ok(None)`;
    /// anything that *is* JSON-RPC must be a well-formed coordination message.
    pub fn from_line(line: &str) -> Result<Option<Self>, CoordinationError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Request(req)) => Self::try_from(req).map(Some),
            Ok(Message::Response(rsp)) => Err(CoordinationError::Malformed {
                method: "<response>".into(),
                reason: format!("unexpected response with id {:?}", rsp.id),
            }),
            Err(err) => {
                warn!(error = %err, "skipping non JSON-RPC line on coordination channel");
                Ok(None)
            }
        }
    }
}

fn params_as<T: serde::de::DeserializeOwned>(
    method: CoordinationMethod,
    params: Option<Value>,
) -> Result<T, CoordinationError> {
    match params {
        None | Some(Value::Null) => Err(CoordinationError::MissingPayload(method.to_string())),
        Some(v) => serde_json::from_value(v).map_err(|e| CoordinationError::Malformed {
            method: method.to_string(),
            reason: e.to_string(),
        }),
    }
}

impl TryFrom<Request> for CoordinationMessage {
    type Error = CoordinationError;

    fn try_from(req: Request) -> Result<Self, Self::Error> {
        let method = req
            .method
            .parse::<CoordinationMethod>()
            .map_err(|_| CoordinationError::UnknownMethod(req.method.clone()))?;
        if req.id.as_ref().is_some_and(|id| *id != Id::Null) {
            return Err(CoordinationError::Malformed {
                method: method.to_string(),
                reason: "coordination messages are notifications and carry no id".into(),
            });
        }
        let msg = match method {
            CoordinationMethod::CredentialUpdateFromWorker => {
                Self::CredentialUpdateFromWorker(params_as(method, req.params)?)
            }
            CoordinationMethod::CredentialUpdateFromMaster => {
                Self::CredentialUpdateFromMaster(params_as(method, req.params)?)
            }
            CoordinationMethod::LogLevelUpdateFromWorker => {
                let p: LogLevelParams = params_as(method, req.params)?;
                Self::LogLevelUpdateFromWorker(p.level)
            }
            CoordinationMethod::LogLevelUpdateFromMaster => {
                let p: LogLevelParams = params_as(method, req.params)?;
                Self::LogLevelUpdateFromMaster(p.level)
            }
        };
        Ok(msg)
    }
}

// -----------------------------------------------------------------------------
// Worker control surface payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub ready: bool,
    pub log_level: LogLevel,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextParams {
    pub entity_id: String,
    #[serde(default)]
    pub preview: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credential_update_wire_shape() {
        let msg = CoordinationMessage::CredentialUpdateFromWorker(Credentials::new("t1", "w1"));
        let v = serde_json::to_value(msg.to_request()).unwrap();
        assert_eq!(
            v,
            json!({
                "jsonrpc": "2.0",
                "method": "credentialUpdateFromWorker",
                "params": {"authToken": "t1", "workerId": "w1"}
            })
        );
    }

    #[test]
    fn log_level_line_decodes() {
        let line = CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Debug).to_line();
        assert!(line.ends_with('\n'));
        let req: Request = serde_json::from_str(line.trim_end()).unwrap();
        let msg = CoordinationMessage::try_from(req).unwrap();
        assert_eq!(msg, CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Debug));
        assert!(msg.is_from_master());
    }

    #[test]
    fn missing_payload_is_rejected() {
        let req = Request::notification("credentialUpdateFromWorker", None);
        assert_eq!(
            CoordinationMessage::try_from(req),
            Err(CoordinationError::MissingPayload("credentialUpdateFromWorker".into()))
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let req = Request::notification("logLevelUpdateFromWorker", Some(json!({"level": "loud"})));
        assert!(matches!(
            CoordinationMessage::try_from(req),
            Err(CoordinationError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let req = Request::notification("messageIn", Some(json!({})));
        assert_eq!(
            CoordinationMessage::try_from(req),
            Err(CoordinationError::UnknownMethod("messageIn".into()))
        );
    }

    #[test]
    fn from_line_skips_noise_but_rejects_bad_rpc() {
        assert_eq!(CoordinationMessage::from_line("   "), Ok(None));
        assert_eq!(CoordinationMessage::from_line("listening on 8080"), Ok(None));
        assert!(CoordinationMessage::from_line(
            r#"{"jsonrpc":"2.0","method":"credentialUpdateFromMaster"}"#
        )
        .is_err());
        assert_eq!(
            CoordinationMessage::from_line(
                r#"{"jsonrpc":"2.0","method":"logLevelUpdateFromWorker","params":{"level":"trace"}}"#
            ),
            Ok(Some(CoordinationMessage::LogLevelUpdateFromWorker(LogLevel::Trace)))
        );
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Critical.to_string(), "critical");
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LevelFilter::from(LogLevel::Critical), LevelFilter::ERROR);
    }

    #[test]
    fn log_level_is_case_insensitive_on_the_wire() {
        let p: LogLevelParams = serde_json::from_value(json!({"level": "DEBUG"})).unwrap();
        assert_eq!(p.level, LogLevel::Debug);
        assert_eq!(
            CoordinationMessage::from_line(
                r#"{"jsonrpc":"2.0","method":"logLevelUpdateFromWorker","params":{"level":"Warn"}}"#
            ),
            Ok(Some(CoordinationMessage::LogLevelUpdateFromWorker(LogLevel::Warn)))
        );
        // still written lowercase
        assert_eq!(serde_json::to_value(LogLevel::Critical).unwrap(), json!("critical"));
        assert!(serde_json::from_value::<LogLevelParams>(json!({"level": "loud"})).is_err());
    }

    #[test]
    fn debug_output_hides_token() {
        let out = format!("{:?}", Credentials::new("secret-token", "w1"));
        assert!(!out.contains("secret-token"));
        assert!(out.contains("w1"));
    }
}
