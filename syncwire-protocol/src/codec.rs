//! Decoding, validation and encoding of message envelopes.

use crate::error::{ErrorCode, ProtocolError};
use crate::message::{
    Message, MessageType, Notification, Operation, Response, ResponseError, ResponseMeta,
};
use bytes::Bytes;
use serde_json::Value;

/// Stateless codec for JSON message envelopes.
pub struct MessageCodec;

impl MessageCodec {
    /// Decodes a payload into a message.
    ///
    /// Only malformed JSON fails here; semantic checks are left to
    /// [`MessageCodec::validate`].
    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Checks type, operation and target fields.
    pub fn validate(msg: &Message) -> Result<(), ProtocolError> {
        match &msg.msg_type {
            MessageType::Ping => Ok(()),
            MessageType::Request => {
                let op = msg
                    .operation
                    .as_ref()
                    .ok_or(ProtocolError::MissingField("operation"))?;
                if !op.is_crud() {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "operation '{}' is not valid for a request",
                        op
                    )));
                }
                Self::require_target(msg)
            }
            MessageType::Subscription => {
                match msg
                    .operation
                    .as_ref()
                    .ok_or(ProtocolError::MissingField("operation"))?
                {
                    Operation::Subscribe => Self::require_target(msg),
                    Operation::Unsubscribe => match msg.subscription_id.as_deref() {
                        Some(id) if !id.is_empty() => Ok(()),
                        _ => Err(ProtocolError::MissingSubscriptionId),
                    },
                    other => Err(ProtocolError::InvalidMessage(format!(
                        "operation '{}' is not valid for a subscription message",
                        other
                    ))),
                }
            }
            other => Err(ProtocolError::InvalidMessage(format!(
                "unsupported message type '{}'",
                other
            ))),
        }
    }

    pub fn is_valid(msg: &Message) -> bool {
        Self::validate(msg).is_ok()
    }

    fn require_target(msg: &Message) -> Result<(), ProtocolError> {
        if msg.schema.is_empty() {
            return Err(ProtocolError::MissingField("schema"));
        }
        if msg.entity.is_empty() {
            return Err(ProtocolError::MissingField("entity"));
        }
        Ok(())
    }

    /// Encodes a success response.
    pub fn encode_response(
        id: &str,
        data: Option<Value>,
        metadata: Option<ResponseMeta>,
    ) -> Result<Bytes, ProtocolError> {
        let response = Response::ok(id, data).with_metadata(metadata.unwrap_or_default());
        Self::encode(&response)
    }

    /// Encodes an error envelope.
    pub fn encode_error(id: &str, code: ErrorCode, message: &str) -> Result<Bytes, ProtocolError> {
        Self::encode(&Response::error(id, ResponseError::new(code, message)))
    }

    pub fn encode_notification(
        subscription_id: &str,
        operation: Operation,
        schema: &str,
        entity: &str,
        data: Value,
    ) -> Result<Bytes, ProtocolError> {
        Self::encode(&Notification::new(
            subscription_id,
            operation,
            schema,
            entity,
            data,
        ))
    }

    pub fn encode_pong(id: &str) -> Result<Bytes, ProtocolError> {
        Self::encode(&Response::pong(id))
    }

    /// Encodes any serializable value as a JSON payload.
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QueryOptions;
    use serde_json::json;

    #[test]
    fn test_decode_malformed() {
        let err = MessageCodec::decode(b"{not json").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::DecodeError);

        let err = MessageCodec::decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_decode_missing_type_is_decode_error() {
        let err = MessageCodec::decode(br#"{"id":"1"}"#).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::DecodeError);
    }

    #[test]
    fn test_decode_numeric_record_id() {
        let msg = MessageCodec::decode(
            br#"{"id":"1","type":"request","operation":"read","schema":"public","entity":"orders","record_id":1}"#,
        )
        .unwrap();
        assert_eq!(msg.record_id.as_deref(), Some("1"));
        assert!(MessageCodec::is_valid(&msg));

        let msg = MessageCodec::decode(
            br#"{"id":"2","type":"request","operation":"delete","schema":"public","entity":"orders","record_id":"a-7"}"#,
        )
        .unwrap();
        assert_eq!(msg.record_id.as_deref(), Some("a-7"));

        let msg = MessageCodec::decode(br#"{"id":"3","type":"ping","record_id":null}"#).unwrap();
        assert!(msg.record_id.is_none());

        let err = MessageCodec::decode(br#"{"id":"4","type":"ping","record_id":{"k":1}}"#)
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::DecodeError);
    }

    #[test]
    fn test_validate_crud_requires_target() {
        let msg = Message::request("1", Operation::Read, "public", "orders");
        assert!(MessageCodec::is_valid(&msg));

        let msg = Message::request("1", Operation::Create, "", "orders");
        let err = MessageCodec::validate(&msg).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidMessage);

        let msg = Message::request("1", Operation::Create, "public", "");
        assert!(!MessageCodec::is_valid(&msg));
    }

    #[test]
    fn test_validate_rejects_unknown_type_and_operation() {
        let msg = MessageCodec::decode(br#"{"id":"1","type":"bogus"}"#).unwrap();
        assert!(!MessageCodec::is_valid(&msg));

        let msg = MessageCodec::decode(
            br#"{"id":"1","type":"request","operation":"upsert","schema":"s","entity":"e"}"#,
        )
        .unwrap();
        let err = MessageCodec::validate(&msg).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_validate_request_rejects_subscription_operation() {
        let msg = Message::request("1", Operation::Subscribe, "public", "orders");
        assert!(!MessageCodec::is_valid(&msg));
    }

    #[test]
    fn test_validate_ping_needs_nothing() {
        assert!(MessageCodec::is_valid(&Message::ping("p")));
    }

    #[test]
    fn test_validate_unsubscribe_requires_id() {
        let msg = MessageCodec::decode(br#"{"id":"1","type":"subscription","operation":"unsubscribe"}"#)
            .unwrap();
        let err = MessageCodec::validate(&msg).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::MissingSubscriptionId);

        assert!(MessageCodec::is_valid(&Message::unsubscribe("1", "sub-1")));
    }

    #[test]
    fn test_validate_subscribe_requires_target() {
        let msg = Message::subscribe("1", "public", "orders")
            .with_options(QueryOptions::default());
        assert!(MessageCodec::is_valid(&msg));
        assert!(!MessageCodec::is_valid(&Message::subscribe("1", "public", "")));
    }

    #[test]
    fn test_encode_envelopes() {
        let bytes = MessageCodec::encode_response("1", Some(json!({"id": 5})), None).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["id"], 5);

        let bytes = MessageCodec::encode_error("2", ErrorCode::HookError, "denied").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "hook_error");
        assert_eq!(value["error"]["message"], "denied");

        let bytes = MessageCodec::encode_pong("3").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "pong");

        let bytes = MessageCodec::encode_notification(
            "sub-1",
            Operation::Delete,
            "public",
            "orders",
            json!({"id": 1}),
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["entity"], "orders");
    }
}
