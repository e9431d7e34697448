//! # Relay Wire Messages
//!
//! JSON text frames exchanged with the conversational relay.
//!
//! ## Outbound (per dialect):
//! | purpose      | `direct`                                   | `enveloped`                          |
//! |--------------|--------------------------------------------|--------------------------------------|
//! | init         | `{type:"initialization", systemInstruction}` | `{type:"start", systemInstruction}` |
//! | audio        | `{type:"audio", payload}`                  | `{type:"input_audio", data}`         |
//! | tool ack     | `{type:"toolResponse", payload:{functionResponses}}` | `{type:"tool_response", response:{functionResponses}}` |
//!
//! ## Inbound:
//! Either a relay envelope `{type:"gemini_msg"|"open"|"close"|"error", message|error}`
//! or the bare upstream message, which the `direct` relay forwards unwrapped.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message vocabulary spoken by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireDialect {
    #[default]
    Direct,
    Enveloped,
}

/// Acknowledgement for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAck {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// Everything the session sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Initialize { system_instruction: String },
    Audio { payload: String },
    ToolResponse(ToolAck),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DirectWire<'a> {
    #[serde(rename = "initialization")]
    Initialization {
        #[serde(rename = "systemInstruction")]
        system_instruction: &'a str,
    },
    #[serde(rename = "audio")]
    Audio { payload: &'a str },
    #[serde(rename = "toolResponse")]
    ToolResponse { payload: FunctionResponses<'a> },
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum EnvelopedWire<'a> {
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "systemInstruction")]
        system_instruction: &'a str,
    },
    #[serde(rename = "input_audio")]
    InputAudio { data: &'a str },
    #[serde(rename = "tool_response")]
    ToolResponse { response: FunctionResponses<'a> },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponses<'a> {
    function_responses: FunctionResponse<'a>,
}

#[derive(Serialize)]
struct FunctionResponse<'a> {
    id: &'a str,
    name: &'a str,
    response: ResponseBody<'a>,
}

#[derive(Serialize)]
struct ResponseBody<'a> {
    result: &'a str,
}

impl<'a> From<&'a ToolAck> for FunctionResponses<'a> {
    fn from(ack: &'a ToolAck) -> Self {
        Self {
            function_responses: FunctionResponse {
                id: ack.id.as_str(),
                name: ack.name.as_str(),
                response: ResponseBody {
                    result: ack.result.as_str(),
                },
            },
        }
    }
}

impl Outbound {
    /// Serialize to a text frame in the given dialect.
    pub fn encode(&self, dialect: WireDialect) -> SessionResult<String> {
        let json = match dialect {
            WireDialect::Direct => serde_json::to_string(&match self {
                Outbound::Initialize { system_instruction } => DirectWire::Initialization {
                    system_instruction: system_instruction.as_str(),
                },
                Outbound::Audio { payload } => DirectWire::Audio {
                    payload: payload.as_str(),
                },
                Outbound::ToolResponse(ack) => DirectWire::ToolResponse {
                    payload: ack.into(),
                },
            })?,
            WireDialect::Enveloped => serde_json::to_string(&match self {
                Outbound::Initialize { system_instruction } => EnvelopedWire::Start {
                    system_instruction: system_instruction.as_str(),
                },
                Outbound::Audio { payload } => EnvelopedWire::InputAudio {
                    data: payload.as_str(),
                },
                Outbound::ToolResponse(ack) => EnvelopedWire::ToolResponse {
                    response: ack.into(),
                },
            })?,
        };
        Ok(json)
    }

    /// Log label.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Initialize { .. } => "initialize",
            Outbound::Audio { .. } => "audio",
            Outbound::ToolResponse(_) => "tool_response",
        }
    }
}

/// One function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// The parts of an upstream message the session acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamMessage {
    /// base64 PCM16 payloads, in part order
    pub audio: Vec<String>,
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub setup_complete: bool,
    pub tool_calls: Vec<FunctionCall>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The relay's own upstream connection opened.
    RelayOpen,
    /// The relay's upstream connection closed.
    RelayClosed { reason: Option<String> },
    /// The relay reported an upstream error.
    RelayError { message: String },
    Upstream(UpstreamMessage),
}

/// Decode one inbound text frame.
pub fn parse_inbound(text: &str) -> SessionResult<Inbound> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(SessionError::Protocol(format!(
            "expected a JSON object, got {}",
            value
        )));
    }

    match value.get("type").and_then(Value::as_str) {
        Some("gemini_msg") => {
            let message = match value.get("message") {
                Some(Value::String(raw)) => serde_json::from_str(raw)?,
                Some(inner) => inner.clone(),
                None => {
                    return Err(SessionError::Protocol(
                        "gemini_msg envelope without a message".into(),
                    ))
                }
            };
            Ok(Inbound::Upstream(parse_upstream(&message)))
        }
        Some("open") => Ok(Inbound::RelayOpen),
        Some("close") => Ok(Inbound::RelayClosed {
            reason: value
                .get("reason")
                .or_else(|| value.get("message"))
                .map(text_of),
        }),
        Some("error") => Ok(Inbound::RelayError {
            message: value
                .get("error")
                .or_else(|| value.get("message"))
                .map(text_of)
                .unwrap_or_else(|| "unspecified relay error".to_string()),
        }),
        Some(other) => Err(SessionError::Protocol(format!(
            "unknown envelope type {:?}",
            other
        ))),
        None => Ok(Inbound::Upstream(parse_upstream(&value))),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull audio, transcripts, flags and tool calls out of an upstream message.
///
/// Missing or oddly shaped fields are simply absent from the result.
pub fn parse_upstream(value: &Value) -> UpstreamMessage {
    let mut msg = UpstreamMessage {
        setup_complete: value.get("setupComplete").is_some(),
        ..Default::default()
    };

    if let Some(content) = value.get("serverContent") {
        msg.interrupted = content.get("interrupted").and_then(Value::as_bool) == Some(true);
        msg.turn_complete = content.get("turnComplete").and_then(Value::as_bool) == Some(true);

        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            msg.audio = parts
                .iter()
                .filter_map(|part| part.pointer("/inlineData/data").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
        }
    }

    msg.input_transcript = transcription(value, "inputTranscription");
    msg.output_transcript = transcription(value, "outputTranscription");

    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        msg.tool_calls = calls
            .iter()
            .map(|call| FunctionCall {
                id: call.get("id").map(text_of).unwrap_or_default(),
                name: call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                args: call.get("args").cloned().unwrap_or(Value::Null),
            })
            .collect();
    }

    msg
}

/// Transcripts appear under `serverContent` or at the top level depending on the relay.
fn transcription(value: &Value, key: &str) -> Option<String> {
    value
        .get("serverContent")
        .and_then(|content| content.get(key))
        .or_else(|| value.get(key))
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ack() -> ToolAck {
        ToolAck {
            id: "call-7".into(),
            name: "setStage".into(),
            result: "OK".into(),
        }
    }

    #[test]
    fn test_direct_dialect_encoding() {
        let init = Outbound::Initialize {
            system_instruction: "Be kind".into(),
        };
        let v: Value = serde_json::from_str(&init.encode(WireDialect::Direct).unwrap()).unwrap();
        assert_eq!(v, json!({"type": "initialization", "systemInstruction": "Be kind"}));

        let audio = Outbound::Audio { payload: "AAA=".into() };
        let v: Value = serde_json::from_str(&audio.encode(WireDialect::Direct).unwrap()).unwrap();
        assert_eq!(v, json!({"type": "audio", "payload": "AAA="}));

        let v: Value = serde_json::from_str(
            &Outbound::ToolResponse(ack()).encode(WireDialect::Direct).unwrap(),
        )
        .unwrap();
        assert_eq!(
            v,
            json!({
                "type": "toolResponse",
                "payload": {"functionResponses": {
                    "id": "call-7", "name": "setStage", "response": {"result": "OK"}
                }}
            })
        );
    }

    #[test]
    fn test_enveloped_dialect_encoding() {
        let init = Outbound::Initialize {
            system_instruction: "Be kind".into(),
        };
        let v: Value =
            serde_json::from_str(&init.encode(WireDialect::Enveloped).unwrap()).unwrap();
        assert_eq!(v, json!({"type": "start", "systemInstruction": "Be kind"}));

        let audio = Outbound::Audio { payload: "AAA=".into() };
        let v: Value =
            serde_json::from_str(&audio.encode(WireDialect::Enveloped).unwrap()).unwrap();
        assert_eq!(v, json!({"type": "input_audio", "data": "AAA="}));

        let v: Value = serde_json::from_str(
            &Outbound::ToolResponse(ack()).encode(WireDialect::Enveloped).unwrap(),
        )
        .unwrap();
        assert_eq!(v["type"], "tool_response");
        assert_eq!(v["response"]["functionResponses"]["id"], "call-7");
    }

    #[test]
    fn test_parse_enveloped_audio_and_transcripts() {
        let frame = json!({
            "type": "gemini_msg",
            "message": {
                "serverContent": {
                    "modelTurn": {"parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                        {"inlineData": {"data": "BBBB"}}
                    ]},
                    "outputTranscription": {"text": "Welcome"},
                    "turnComplete": true
                }
            }
        });
        let Inbound::Upstream(msg) = parse_inbound(&frame.to_string()).unwrap() else {
            panic!("expected upstream message");
        };
        assert_eq!(msg.audio, vec!["AAAA".to_string(), "BBBB".to_string()]);
        assert_eq!(msg.output_transcript.as_deref(), Some("Welcome"));
        assert!(msg.turn_complete);
        assert!(!msg.interrupted);
    }

    #[test]
    fn test_parse_bare_upstream_message() {
        let frame = json!({
            "inputTranscription": {"text": "hello"},
            "serverContent": {"interrupted": true}
        });
        let Inbound::Upstream(msg) = parse_inbound(&frame.to_string()).unwrap() else {
            panic!("expected upstream message");
        };
        assert!(msg.interrupted);
        assert_eq!(msg.input_transcript.as_deref(), Some("hello"));
    }

    #[test]
    fn test_parse_stringified_message() {
        let inner = json!({"setupComplete": {}}).to_string();
        let frame = json!({"type": "gemini_msg", "message": inner});
        let Inbound::Upstream(msg) = parse_inbound(&frame.to_string()).unwrap() else {
            panic!("expected upstream message");
        };
        assert!(msg.setup_complete);
    }

    #[test]
    fn test_parse_tool_calls() {
        let frame = json!({
            "toolCall": {"functionCalls": [
                {"id": "a1", "name": "setStage", "args": {"stageNumber": 2}},
                {"id": "a2", "name": "completeOnboarding"}
            ]}
        });
        let Inbound::Upstream(msg) = parse_inbound(&frame.to_string()).unwrap() else {
            panic!("expected upstream message");
        };
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].args, json!({"stageNumber": 2}));
        assert_eq!(msg.tool_calls[1].args, Value::Null);
    }

    #[test]
    fn test_parse_relay_lifecycle() {
        assert_eq!(parse_inbound(r#"{"type":"open"}"#).unwrap(), Inbound::RelayOpen);
        assert_eq!(
            parse_inbound(r#"{"type":"error","error":"quota"}"#).unwrap(),
            Inbound::RelayError { message: "quota".into() }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"close"}"#).unwrap(),
            Inbound::RelayClosed { reason: None }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_inbound("nope"), Err(SessionError::Protocol(_))));
        assert!(matches!(parse_inbound("[1,2]"), Err(SessionError::Protocol(_))));
        assert!(matches!(
            parse_inbound(r#"{"type":"mystery"}"#),
            Err(SessionError::Protocol(_))
        ));
    }
}
