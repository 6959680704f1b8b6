//! Wire types shared by the remote store client, the sync engine and the
//! composer. Field names follow the store's snake_case JSON.

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type GroupId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// A message from either conversation domain. Group messages carry no
/// `receiver_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub voice_url: Option<String>,
    #[serde(default)]
    pub voice_duration: Option<u32>,
    #[serde(default)]
    pub is_read: Option<bool>,
    pub created_at: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
    Voice,
}

impl AttachmentKind {
    /// Kind for an uploaded file, decided by its MIME type.
    pub fn for_mime(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(value) if value.starts_with("image/") => AttachmentKind::Image,
            _ => AttachmentKind::File,
        }
    }

    /// Placeholder content sent alongside the attachment URL.
    pub fn placeholder(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "🖼️ Image",
            AttachmentKind::File => "📎 File",
            AttachmentKind::Voice => "🎤 Voice message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub url: String,
    pub display_name: String,
    pub kind: AttachmentKind,
}

impl Message {
    pub fn attachment(&self) -> Option<Attachment> {
        if let Some(url) = self.voice_url.as_deref().filter(|url| !url.is_empty()) {
            return Some(Attachment {
                url: url.to_string(),
                display_name: "voice".to_string(),
                kind: AttachmentKind::Voice,
            });
        }

        let url = self.file_url.as_deref().filter(|url| !url.is_empty())?;
        let display_name = self
            .file_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string());
        let mime = mime_guess::from_path(&display_name).first();
        let kind = AttachmentKind::for_mime(mime.as_ref().map(|mime| mime.essence_str()));
        Some(Attachment {
            url: url.to_string(),
            display_name,
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub member_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}
