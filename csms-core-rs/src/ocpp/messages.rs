//! OCPP-J message framing
//!
//! OCPP-J carries RPC over WebSocket as JSON arrays:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding only checks the envelope structure. Payloads are carried as raw
//! JSON and interpreted by handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OcppError;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP 1.6-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // Charge point -> central system
    Authorize,
    BootNotification,
    DataTransfer,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,

    // Central system -> charge point
    CancelReservation,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    GetConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReserveNow,
    Reset,
    TriggerMessage,
    UnlockConnector,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::DataTransfer => "DataTransfer",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::CancelReservation => "CancelReservation",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearCache => "ClearCache",
            Action::GetConfiguration => "GetConfiguration",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ReserveNow => "ReserveNow",
            Action::Reset => "Reset",
            Action::TriggerMessage => "TriggerMessage",
            Action::UnlockConnector => "UnlockConnector",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "DataTransfer" => Ok(Action::DataTransfer),
            "Heartbeat" => Ok(Action::Heartbeat),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StopTransaction" => Ok(Action::StopTransaction),
            "CancelReservation" => Ok(Action::CancelReservation),
            "ChangeAvailability" => Ok(Action::ChangeAvailability),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "ClearCache" => Ok(Action::ClearCache),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "ReserveNow" => Ok(Action::ReserveNow),
            "Reset" => Ok(Action::Reset),
            "TriggerMessage" => Ok(Action::TriggerMessage),
            "UnlockConnector" => Ok(Action::UnlockConnector),
            other => Err(other.to_string()),
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a CALL with a caller-chosen message id
    pub fn new(
        message_id: impl Into<String>,
        action: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| OcppError::malformed(format!("invalid JSON: {}", e)))?;

        let array = value
            .as_array()
            .ok_or_else(|| OcppError::malformed("envelope is not an array"))?;

        let tag = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| OcppError::malformed("missing message type"))?;

        let msg_type = MessageType::from_tag(tag)
            .ok_or_else(|| OcppError::malformed(format!("unknown message type {}", tag)))?;

        if array.len() != msg_type.arity() {
            return Err(OcppError::malformed(format!(
                "{:?} expects {} elements, got {}",
                msg_type,
                msg_type.arity(),
                array.len()
            )));
        }

        let message_id = match array[1].as_str() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(OcppError::malformed("missing message id")),
        };

        match msg_type {
            MessageType::Call => {
                let action = match array[2].as_str() {
                    Some(action) if !action.is_empty() => action.to_string(),
                    _ => return Err(OcppError::malformed("missing action")),
                };

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            MessageType::CallResult => Ok(OcppMessage::CallResult(CallResult {
                message_id,
                payload: array[2].clone(),
            })),
            MessageType::CallError => {
                let error_code_str = array[2]
                    .as_str()
                    .ok_or_else(|| OcppError::malformed("missing error code"))?;

                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3]
                    .as_str()
                    .ok_or_else(|| OcppError::malformed("missing error description"))?
                    .to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        let bytes = self.to_bytes()?;
        // serde_json only ever emits UTF-8
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_malformed(raw: &str) {
        match OcppMessage::parse(raw.as_bytes()) {
            Err(OcppError::MalformedEnvelope(_)) => {}
            other => panic!("Expected MalformedEnvelope for {}, got {:?}", raw, other),
        }
    }

    #[test]
    fn test_call_serialization() {
        let call = Call::new("42", Action::Heartbeat.as_str(), json!({})).unwrap();
        let text = String::from_utf8(call.to_bytes().unwrap()).unwrap();

        assert_eq!(text, r#"[2,"42","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "BootNotification", {"chargePointModel": "EVSE-123", "chargePointVendor": "EV-Charger Inc."}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "BootNotification");
                assert_eq!(call.payload["chargePointModel"], "EVSE-123");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let msg = OcppMessage::parse(br#"[2, "7", "VendorSpecificThing", {}]"#).unwrap();
        assert_eq!(msg.message_type(), MessageType::Call);
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2025-02-26T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                assert_eq!(result.payload["currentTime"], "2025-02-26T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_error_code_maps_to_generic() {
        let msg = OcppMessage::parse(br#"[4, "1", "Kaboom", "", {}]"#).unwrap();
        match msg {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_structural_failures() {
        assert_malformed("not json");
        assert_malformed(r#"{"kind": 2}"#);
        assert_malformed("[]");
        assert_malformed(r#"[9, "1", {}]"#);
        assert_malformed(r#"["2", "1", "Heartbeat", {}]"#);
        assert_malformed(r#"[2, "", "Heartbeat", {}]"#);
        assert_malformed(r#"[2, 17, "Heartbeat", {}]"#);
        assert_malformed(r#"[2, "1", "", {}]"#);
        assert_malformed(r#"[2, "1", {}]"#);
        assert_malformed(r#"[3, "1"]"#);
        assert_malformed(r#"[4, "1", "GenericError", {}]"#);
    }

    #[test]
    fn test_round_trip_preserves_envelopes() {
        let messages = vec![
            OcppMessage::Call(
                Call::new("a1", "RemoteStopTransaction", json!({"transactionId": 12345})).unwrap(),
            ),
            OcppMessage::CallResult(CallResult::new("a1", json!({"status": "Accepted"})).unwrap()),
            OcppMessage::CallResult(CallResult::new("a2", Value::Null).unwrap()),
            OcppMessage::CallError(CallError {
                message_id: "a3".into(),
                error_code: ErrorCode::PropertyConstraintViolation,
                error_description: "connectorId out of range".into(),
                error_details: json!({"connectorId": 99}),
            }),
        ];

        for msg in messages {
            let decoded = OcppMessage::parse(&msg.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_round_trip_over_codes_and_payload_shapes() {
        let codes = [
            ErrorCode::NotImplemented,
            ErrorCode::NotSupported,
            ErrorCode::InternalError,
            ErrorCode::ProtocolError,
            ErrorCode::SecurityError,
            ErrorCode::FormationViolation,
            ErrorCode::PropertyConstraintViolation,
            ErrorCode::OccurrenceConstraintViolation,
            ErrorCode::TypeConstraintViolation,
            ErrorCode::GenericError,
        ];
        let payloads = [
            Value::Null,
            json!({}),
            json!([]),
            json!([1, "two", null, {"three": 3.5}]),
            json!({"meterValue": [{"timestamp": "2025-02-26T12:00:00Z", "sampledValue": [{"value": "12.5", "unit": "kWh"}]}]}),
            json!({"idTag": "ÄÖÜ-充电-🔌", "note": "line\nbreak \"quoted\""}),
            json!({"big": i64::MAX, "negative": -1, "flag": false}),
        ];
        let ids = ["1", "019a2b3c-uuid-like", "ünïcødé-id", "🔋", "id with spaces"];

        let mut messages = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let id = ids[i % ids.len()];
            messages.push(OcppMessage::Call(Call::new(id, "DataTransfer", payload).unwrap()));
            messages.push(OcppMessage::CallResult(CallResult::new(id, payload).unwrap()));
        }
        for (i, code) in codes.iter().enumerate() {
            messages.push(OcppMessage::CallError(CallError {
                message_id: ids[i % ids.len()].to_string(),
                error_code: *code,
                error_description: format!("{} happened", code),
                error_details: payloads[i % payloads.len()].clone(),
            }));
        }

        for msg in messages {
            let bytes = msg.to_bytes().unwrap();
            let decoded = OcppMessage::parse(&bytes).unwrap();
            assert_eq!(decoded, msg, "round trip of {}", String::from_utf8_lossy(&bytes));
            assert_eq!(decoded.to_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Action::RemoteStopTransaction.to_string(), "RemoteStopTransaction");
        assert_eq!("Authorize".parse::<Action>(), Ok(Action::Authorize));
        assert!("Nope".parse::<Action>().is_err());
    }
}
