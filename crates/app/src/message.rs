use arbor_llm::{InlineAttachment, ProviderMessage, Role as ProviderRole};
use serde::{Deserialize, Serialize};

/// Prefix of the reasoning half of the legacy composite text.
pub const THOUGHTS_PREFIX: &str = "Thoughts:";
/// Separator between reasoning and answer in the legacy composite text.
pub const ANSWER_SEPARATOR: &str = "\n---\nAnswer:";

pub const AUDIO_ATTACHMENT_NAME: &str = "response-audio.wav";
pub const AUDIO_MIME_TYPE: &str = "audio/wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl From<Role> for ProviderRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ProviderRole::User,
            Role::Model => ProviderRole::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64 file contents.
    pub payload: String,
    #[serde(default)]
    pub preview_url: String,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let mime_type = mime_type.into();
        let payload = payload.into();
        let preview_url = format!("data:{mime_type};base64,{payload}");
        Self {
            name: name.into(),
            mime_type,
            payload,
            preview_url,
        }
    }

    pub fn audio(payload: impl Into<String>) -> Self {
        Self::new(AUDIO_ATTACHMENT_NAME, AUDIO_MIME_TYPE, payload)
    }

    pub fn to_inline(&self) -> InlineAttachment {
        InlineAttachment::new(&self.name, &self.mime_type, &self.payload)
    }
}

/// One turn in a node's history.
///
/// Model turns keep reasoning and answer apart: `content` is the answer and `thoughts`
/// the optional reasoning. The legacy single-string form is produced by
/// [`Message::display_text`] and only parsed back when importing old trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            thoughts: None,
            attachments,
            model_id: None,
            is_error: false,
        }
    }

    pub fn model(content: impl Into<String>, model_id: Option<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
            thoughts: None,
            attachments: Vec::new(),
            model_id,
            is_error: false,
        }
    }

    /// Empty model turn that a stream fills in place.
    pub fn placeholder(model_id: Option<String>) -> Self {
        Self::model(String::new(), model_id)
    }

    pub fn model_error(message: impl Into<String>, model_id: Option<String>) -> Self {
        Self {
            is_error: true,
            ..Self::model(message, model_id)
        }
    }

    pub fn is_empty_placeholder(&self) -> bool {
        self.role == Role::Model
            && self.content.is_empty()
            && self.thoughts.as_deref().is_none_or(str::is_empty)
            && self.attachments.is_empty()
    }

    /// Text as the legacy convention renders it.
    pub fn display_text(&self) -> String {
        match (&self.role, self.thoughts.as_deref()) {
            (Role::Model, Some(thoughts)) => compose(thoughts, &self.content),
            _ => self.content.clone(),
        }
    }

    /// Splits composite text stored by older trees into its two fields.
    pub fn upgrade_legacy_content(&mut self) -> bool {
        if self.role != Role::Model || self.thoughts.is_some() {
            return false;
        }

        match split_composite(&self.content) {
            (Some(thoughts), answer) => {
                self.thoughts = Some(thoughts);
                self.content = answer;
                true
            }
            (None, _) => false,
        }
    }

    /// Upstream form of this turn. Model turns replay the answer only.
    pub fn to_provider_message(&self) -> ProviderMessage {
        let message = ProviderMessage::new(self.role.into(), self.content.clone());
        match self.role {
            Role::User => message.with_attachments(
                self.attachments.iter().map(Attachment::to_inline).collect(),
            ),
            Role::Model => message,
        }
    }
}

/// Renders reasoning and answer as one string.
///
/// Empty reasoning yields the bare answer; reasoning without an answer yet yields
/// `Thoughts:<reasoning>`.
pub fn compose(thoughts: &str, answer: &str) -> String {
    if thoughts.is_empty() {
        answer.to_string()
    } else if answer.is_empty() {
        format!("{THOUGHTS_PREFIX}{thoughts}")
    } else {
        format!("{THOUGHTS_PREFIX}{thoughts}{ANSWER_SEPARATOR}{answer}")
    }
}

pub fn split_composite(text: &str) -> (Option<String>, String) {
    let Some(rest) = text.strip_prefix(THOUGHTS_PREFIX) else {
        return (None, text.to_string());
    };

    match rest.split_once(ANSWER_SEPARATOR) {
        Some((thoughts, answer)) => (Some(thoughts.to_string()), answer.to_string()),
        None => (Some(rest.to_string()), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_rendering_follows_the_thoughts_answer_convention() {
        assert_eq!(compose("abc", "xyz"), "Thoughts:abc\n---\nAnswer:xyz");
        assert_eq!(compose("", "xyz"), "xyz");
        assert_eq!(compose("abc", ""), "Thoughts:abc");
    }

    #[test]
    fn legacy_composite_text_is_split_on_import() {
        let mut message = Message::model("Thoughts:step one\n---\nAnswer:42", None);
        assert!(message.upgrade_legacy_content());
        assert_eq!(message.thoughts.as_deref(), Some("step one"));
        assert_eq!(message.content, "42");
        assert_eq!(message.display_text(), "Thoughts:step one\n---\nAnswer:42");

        let mut plain = Message::model("just an answer", None);
        assert!(!plain.upgrade_legacy_content());
        assert_eq!(plain.content, "just an answer");
    }

    #[test]
    fn user_text_that_looks_composite_is_left_alone() {
        let mut message = Message::user("Thoughts:not mine\n---\nAnswer:no", Vec::new());
        assert!(!message.upgrade_legacy_content());
    }

    #[test]
    fn model_turns_replay_only_the_answer() {
        let mut message = Message::model("final", Some("gpt-4o".to_string()));
        message.thoughts = Some("private reasoning".to_string());
        let provider_message = message.to_provider_message();

        assert_eq!(provider_message.role, ProviderRole::Model);
        assert_eq!(provider_message.content, "final");
    }

    #[test]
    fn serialized_messages_omit_empty_optional_fields() {
        let json = serde_json::to_string(&Message::user("hi", Vec::new())).unwrap();
        assert_eq!(json, "{\"role\":\"user\",\"content\":\"hi\"}");
    }
}
