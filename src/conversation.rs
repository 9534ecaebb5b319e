use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Group,
    Direct,
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Group => "group",
            ConversationType::Direct => "direct",
        }
    }
}

impl FromStr for ConversationType {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(ConversationType::Group),
            "direct" => Ok(ConversationType::Direct),
            other => Err(ChatError::InvalidRequest(format!(
                "unknown conversation type '{other}'"
            ))),
        }
    }
}

/// A group chat or direct thread. Doubles as the room key: `group:abc123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_type: ConversationType,
    pub conversation_id: String,
}

impl ConversationRef {
    pub fn new(conversation_type: ConversationType, conversation_id: impl Into<String>) -> Self {
        ConversationRef {
            conversation_type,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(ConversationType::Group, id)
    }

    pub fn direct(id: impl Into<String>) -> Self {
        Self::new(ConversationType::Direct, id)
    }

    pub fn room_name(&self) -> String {
        self.to_string()
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.conversation_id.trim().is_empty() {
            return Err(ChatError::InvalidRequest(
                "conversation id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.conversation_type.as_str(), self.conversation_id)
    }
}

impl FromStr for ConversationRef {
    type Err = ChatError;

    fn from_str(room: &str) -> Result<Self, Self::Err> {
        let (kind, id) = room
            .split_once(':')
            .ok_or_else(|| ChatError::InvalidRequest(format!("malformed room name '{room}'")))?;
        let conversation = ConversationRef::new(kind.parse()?, id);
        conversation.validate()?;
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_uses_type_prefix() {
        assert_eq!(ConversationRef::group("abc123").room_name(), "group:abc123");
        assert_eq!(ConversationRef::direct("d9").room_name(), "direct:d9");
    }

    #[test]
    fn parses_room_names() {
        let parsed: ConversationRef = "group:g1".parse().unwrap();
        assert_eq!(parsed, ConversationRef::group("g1"));

        assert!("dm:x".parse::<ConversationRef>().is_err());
        assert!("group:".parse::<ConversationRef>().is_err());
        assert!("group".parse::<ConversationRef>().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ConversationRef::group("g1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"conversationType": "group", "conversationId": "g1"})
        );
    }
}
