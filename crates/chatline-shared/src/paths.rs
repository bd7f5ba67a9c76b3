use crate::types::{ConversationId, MessageId, UserId};

/// `messages/{cid}`: the ordered message collection of a conversation.
pub fn messages(conversation: &ConversationId) -> String {
    format!("messages/{conversation}")
}

pub fn message(conversation: &ConversationId, id: &MessageId) -> String {
    format!("messages/{conversation}/{id}")
}

pub fn reaction(conversation: &ConversationId, id: &MessageId, emoji: &str) -> String {
    format!("messages/{conversation}/{id}/reactions/{emoji}")
}

/// `chats/{cid}`: conversation metadata (participants, last message preview).
pub fn conversation_meta(conversation: &ConversationId) -> String {
    format!("chats/{conversation}")
}

/// `typing/{cid}`: every participant's typing node for a conversation.
pub fn typing_root(conversation: &ConversationId) -> String {
    format!("typing/{conversation}")
}

pub fn typing(conversation: &ConversationId, user: &UserId) -> String {
    format!("typing/{conversation}/{user}")
}

pub fn presence(user: &UserId) -> String {
    format!("status/{user}")
}

pub fn users() -> String {
    "users".to_string()
}

pub fn user_profile(user: &UserId) -> String {
    format!("users/{user}")
}

/// `userChats/{uid}`: the user's active-conversation index.
pub fn user_chats(user: &UserId) -> String {
    format!("userChats/{user}")
}

pub fn chat_settings(user: &UserId, conversation: &ConversationId) -> String {
    format!("chatSettings/{user}/{conversation}")
}

/// `calls/{uid}`: the callee's inbox, holding at most one ringing call.
pub fn call_inbox(user: &UserId) -> String {
    format!("calls/{user}")
}

/// `calls/{uid}/claims`: accept and cancel claims racing for the ringing
/// call, ordered by push key.
pub fn call_claims(user: &UserId) -> String {
    format!("calls/{user}/claims")
}

/// `callResponses/{uid}`: where the callee answers the caller.
pub fn call_response(user: &UserId) -> String {
    format!("callResponses/{user}")
}
