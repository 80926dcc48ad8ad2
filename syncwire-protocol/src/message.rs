//! JSON message envelopes exchanged between clients and the engine.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Envelope type.
///
/// Unrecognized values decode into [`MessageType::Unknown`] so that the
/// codec can reject them as `invalid_message` rather than `decode_error`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Subscription,
    Ping,
    Pong,
    Error,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Subscription => "subscription",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Unknown(s) => s,
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "request" => MessageType::Request,
            "response" => MessageType::Response,
            "notification" => MessageType::Notification,
            "subscription" => MessageType::Subscription,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            _ => MessageType::Unknown(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation requested by a `request` or `subscription` message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Meta,
    Subscribe,
    Unsubscribe,
    Unknown(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Meta => "meta",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::Unknown(s) => s,
        }
    }

    /// Returns true for read/create/update/delete/meta.
    pub fn is_crud(&self) -> bool {
        matches!(
            self,
            Operation::Read
                | Operation::Create
                | Operation::Update
                | Operation::Delete
                | Operation::Meta
        )
    }

    /// Returns true for operations that change stored records.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        match s.as_str() {
            "read" => Operation::Read,
            "create" => Operation::Create,
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            "meta" => Operation::Meta,
            "subscribe" => Operation::Subscribe,
            "unsubscribe" => Operation::Unsubscribe,
            _ => Operation::Unknown(s),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter comparison operator.
///
/// Unrecognized operator strings decode as [`FilterOperator::Eq`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilterOperator {
    #[default]
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::Like => "like",
            FilterOperator::Ilike => "ilike",
            FilterOperator::In => "in",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "neq" | "ne" => FilterOperator::Neq,
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "like" => FilterOperator::Like,
            "ilike" => FilterOperator::Ilike,
            "in" => FilterOperator::In,
            _ => FilterOperator::Eq,
        }
    }
}

impl From<String> for FilterOperator {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<FilterOperator> for String {
    fn from(op: FilterOperator) -> Self {
        op.as_str().to_string()
    }
}

/// A single `column operator value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub column: String,
    #[serde(default)]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl FilterOption {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOperator::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOption {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Relation to load alongside the primary records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadOption {
    pub relation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
}

/// Query options attached to read requests and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Column projection; empty selects every column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload: Vec<PreloadOption>,
}

impl QueryOptions {
    pub fn with_filter(mut self, filter: FilterOption) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Inbound message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Caller-supplied id, echoed in the response.
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub msg_type: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entity: String,

    /// Primary key of the target record. Numeric keys are accepted and kept
    /// in their decimal form.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "record_key"
    )]
    pub record_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Opaque credential presented on first contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Reads a record key given as a string, number or boolean.
fn record_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "record_id must be a string or number, got {other}"
        ))),
    }
}

impl Message {
    fn base(id: impl Into<String>, msg_type: MessageType, operation: Option<Operation>) -> Self {
        Self {
            id: id.into(),
            msg_type,
            operation,
            schema: String::new(),
            entity: String::new(),
            record_id: None,
            subscription_id: None,
            options: None,
            data: None,
            auth: None,
        }
    }

    /// Builds a CRUD request.
    pub fn request(
        id: impl Into<String>,
        operation: Operation,
        schema: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(id, MessageType::Request, Some(operation));
        msg.schema = schema.into();
        msg.entity = entity.into();
        msg
    }

    pub fn subscribe(
        id: impl Into<String>,
        schema: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(id, MessageType::Subscription, Some(Operation::Subscribe));
        msg.schema = schema.into();
        msg.entity = entity.into();
        msg
    }

    pub fn unsubscribe(id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        let mut msg = Self::base(id, MessageType::Subscription, Some(Operation::Unsubscribe));
        msg.subscription_id = Some(subscription_id.into());
        msg
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self::base(id, MessageType::Ping, None)
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// Options or an empty set.
    pub fn options_or_default(&self) -> QueryOptions {
        self.options.clone().unwrap_or_default()
    }
}

/// Error details in an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Response metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,

    /// Additional metadata fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ResponseMeta {
    pub fn is_empty(&self) -> bool {
        self.total.is_none()
            && self.count.is_none()
            && self.limit.is_none()
            && self.offset.is_none()
            && self.server_time.is_none()
            && self.extra.is_empty()
    }
}

/// Outbound response envelope (success, error and pong).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,

    #[serde(rename = "type")]
    pub msg_type: MessageType,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Response,
            success: true,
            data,
            metadata: None,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            success: false,
            data: None,
            metadata: None,
            error: Some(error),
        }
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Pong,
            success: true,
            data: None,
            metadata: None,
            error: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ResponseMeta) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }
}

/// Change notification delivered to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    pub operation: Operation,

    pub subscription_id: String,

    pub schema: String,

    pub entity: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        subscription_id: impl Into<String>,
        operation: Operation,
        schema: impl Into<String>,
        entity: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            msg_type: MessageType::Notification,
            operation,
            subscription_id: subscription_id.into(),
            schema: schema.into(),
            entity: entity.into(),
            data,
            timestamp: Some(Utc::now()),
        }
    }
}
