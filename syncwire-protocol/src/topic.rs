//! Topic naming and wildcard filter matching.
//!
//! Topics are `/`-separated levels. In filters `+` matches exactly one level
//! and `#`, allowed only as the last level, matches every remaining level
//! including none.

use crate::error::ProtocolError;

/// Builds the per-connection topics under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/{connection_id}/request`
    pub fn request(&self, connection_id: &str) -> String {
        format!("{}/{}/request", self.prefix, connection_id)
    }

    /// `{prefix}/{connection_id}/response`
    pub fn response(&self, connection_id: &str) -> String {
        format!("{}/{}/response", self.prefix, connection_id)
    }

    /// `{prefix}/{connection_id}/notify/{subscription_id}`
    pub fn notify(&self, connection_id: &str, subscription_id: &str) -> String {
        format!(
            "{}/{}/notify/{}",
            self.prefix, connection_id, subscription_id
        )
    }

    /// `{prefix}/{connection_id}/notify/+`
    pub fn notify_wildcard(&self, connection_id: &str) -> String {
        format!("{}/{}/notify/+", self.prefix, connection_id)
    }

    /// `{prefix}/+/request`, the engine's inbound filter.
    pub fn request_wildcard(&self) -> String {
        format!("{}/+/request", self.prefix)
    }

    /// Extracts the connection id from a request topic.
    pub fn connection_from_request_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let id = rest.strip_suffix("/request")?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TOPIC_PREFIX)
    }
}

/// Returns true if `topic` matches `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a concrete topic name (publish target).
pub fn validate_topic(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidPacket("empty topic".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::InvalidPacket(format!(
            "topic '{}' contains wildcards",
            topic
        )));
    }
    Ok(())
}

/// Validates a subscription filter.
pub fn validate_filter(filter: &str) -> Result<(), ProtocolError> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidPacket("empty filter".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains(['+', '#']);
        let valid = match *level {
            "+" => true,
            "#" => i == last,
            _ => !has_wildcard,
        };
        if !valid {
            return Err(ProtocolError::InvalidPacket(format!(
                "invalid filter '{}'",
                filter
            )));
        }
    }
    Ok(())
}
