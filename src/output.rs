use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::dates;
use crate::models::{Attachment, AttachmentKind, Group, GroupMember, Message, User, UserId};
use crate::selector::Target;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy)]
pub enum JsonFormat {
    Pretty,
    Compact,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListOutput {
    pub users: Vec<User>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListOutput {
    pub groups: Vec<Group>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberListOutput {
    pub group_id: i64,
    pub members: Vec<GroupMember>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub message: Message,
    pub preview: String,
    pub outgoing: bool,
    pub relative_date: String,
    pub attachment: Option<Attachment>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineOutput {
    pub conversation: Target,
    pub items: Vec<MessageSummary>,
}

pub fn resolve_json_format(compact: bool) -> JsonFormat {
    if compact {
        JsonFormat::Compact
    } else {
        JsonFormat::Pretty
    }
}

pub fn json_string<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<String, OutputError> {
    let payload = match format {
        JsonFormat::Pretty => serde_json::to_string_pretty(value)?,
        JsonFormat::Compact => serde_json::to_string(value)?,
    };
    Ok(payload)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<(), OutputError> {
    let payload = json_string(value, format)?;
    println!("{payload}");
    Ok(())
}

pub fn message_summary(message: &Message, me: UserId, now: DateTime<Utc>) -> MessageSummary {
    let attachment = message.attachment();
    MessageSummary {
        preview: message_preview(message, attachment.as_ref()),
        outgoing: message.sender_id == me,
        relative_date: dates::relative_from_raw(&message.created_at, now),
        attachment,
        message: message.clone(),
    }
}

pub fn timeline_output(target: Target, messages: &[Message], me: UserId, now: DateTime<Utc>) -> TimelineOutput {
    TimelineOutput {
        conversation: target,
        items: messages
            .iter()
            .map(|message| message_summary(message, me, now))
            .collect(),
    }
}

fn message_preview(message: &Message, attachment: Option<&Attachment>) -> String {
    let text = normalize_preview_text(&message.content);
    let Some(attachment) = attachment else {
        return text;
    };
    let detail = match attachment.kind {
        AttachmentKind::Voice => match message.voice_duration {
            Some(seconds) => format!("[voice {}] {}", dates::format_duration(seconds), attachment.url),
            None => format!("[voice] {}", attachment.url),
        },
        AttachmentKind::Image => format!("[image {}] {}", attachment.display_name, attachment.url),
        AttachmentKind::File => format!("[file {}] {}", attachment.display_name, attachment.url),
    };
    if text.is_empty() {
        detail
    } else {
        format!("{text} {detail}")
    }
}

fn normalize_preview_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Single line used by the interactive session for each new message.
pub fn format_message_line(summary: &MessageSummary) -> String {
    let sender = if summary.outgoing {
        "you".to_string()
    } else if summary.message.sender_name.is_empty() {
        format!("user {}", summary.message.sender_id)
    } else {
        summary.message.sender_name.clone()
    };
    format!("[{}] {}: {}", summary.relative_date, sender, summary.preview)
}

pub fn print_user(user: &User, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(user, json_format);
    }
    println!("{} (id {})", user.username, user.id);
    if let Some(status) = user.status.as_deref() {
        println!("  status:    {status}");
    }
    if let Some(last_seen) = user.last_seen.as_deref() {
        println!("  last seen: {}", dates::relative_from_raw(last_seen, Utc::now()));
    }
    if let Some(bio) = user.bio.as_deref().filter(|bio| !bio.is_empty()) {
        println!("  bio:       {}", normalize_preview_text(bio));
    }
    if let Some(avatar_url) = user.avatar_url.as_deref() {
        println!("  avatar:    {avatar_url}");
    }
    Ok(())
}

pub fn print_group(group: &Group, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(group, json_format);
    }
    println!("{} (group {})", group.name, group.id);
    if let Some(description) = group.description.as_deref().filter(|value| !value.is_empty()) {
        println!("  {}", normalize_preview_text(description));
    }
    if let Some(count) = group.member_count {
        println!("  members: {count}");
    }
    Ok(())
}

pub fn print_users(output: &UserListOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    let mut name_width = display_width("username");
    for user in &output.users {
        name_width = name_width.max(display_width(&user.username));
    }
    name_width = name_width.min(24);

    println!(
        "{}  {}  {}  {}",
        pad_left("id", 6),
        pad_right("username", name_width),
        pad_right("status", 8),
        pad_right("bio", 48),
    );
    for user in &output.users {
        let status = user.status.as_deref().unwrap_or("-");
        let bio = user.bio.as_deref().filter(|bio| !bio.is_empty()).unwrap_or("-");
        println!(
            "{}  {}  {}  {}",
            pad_left(&user.id.to_string(), 6),
            pad_right(&truncate_display(&user.username, name_width), name_width),
            pad_right(&truncate_display(status, 8), 8),
            pad_right(&truncate_display(&normalize_preview_text(bio), 48), 48),
        );
    }
    Ok(())
}

pub fn print_groups(output: &GroupListOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    let mut name_width = display_width("name");
    for group in &output.groups {
        name_width = name_width.max(display_width(&group.name));
    }
    name_width = name_width.min(28);

    println!(
        "{}  {}  {}  {}",
        pad_left("id", 6),
        pad_right("name", name_width),
        pad_left("members", 7),
        pad_right("description", 48),
    );
    for group in &output.groups {
        let members = group
            .member_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "-".to_string());
        let description = group
            .description
            .as_deref()
            .filter(|value| !value.is_empty())
            .unwrap_or("-");
        println!(
            "{}  {}  {}  {}",
            pad_left(&group.id.to_string(), 6),
            pad_right(&truncate_display(&group.name, name_width), name_width),
            pad_left(&members, 7),
            pad_right(&truncate_display(&normalize_preview_text(description), 48), 48),
        );
    }
    Ok(())
}

pub fn print_members(output: &MemberListOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    let mut name_width = display_width("username");
    for member in &output.members {
        name_width = name_width.max(display_width(&member.username));
    }
    name_width = name_width.min(24);

    println!("Members of group {}", output.group_id);
    println!(
        "{}  {}  {}",
        pad_left("user", 6),
        pad_right("username", name_width),
        pad_right("role", 8),
    );
    for member in &output.members {
        println!(
            "{}  {}  {}",
            pad_left(&member.id.to_string(), 6),
            pad_right(&truncate_display(&member.username, name_width), name_width),
            pad_right(member.role.as_deref().unwrap_or("member"), 8),
        );
    }
    Ok(())
}

pub fn print_timeline(output: &TimelineOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    println!("Messages for {}", output.conversation);
    let mut from_width = display_width("from");
    let mut when_width = display_width("when");
    for item in &output.items {
        from_width = from_width.max(display_width(&item.message.sender_name));
        when_width = when_width.max(display_width(&item.relative_date));
    }
    from_width = from_width.min(18);
    when_width = when_width.min(10);

    println!(
        "{}  {}  {}  {}",
        pad_left("id", 6),
        pad_right("when", when_width),
        pad_right("from", from_width),
        pad_right("text", 72),
    );
    for item in &output.items {
        println!(
            "{}  {}  {}  {}",
            pad_left(&item.message.id.to_string(), 6),
            pad_right(&item.relative_date, when_width),
            pad_right(&truncate_display(&item.message.sender_name, from_width), from_width),
            pad_right(&truncate_display(&item.preview, 72), 72),
        );
    }
    Ok(())
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}

fn pad_right(value: &str, width: usize) -> String {
    let mut output = value.to_string();
    let current = display_width(value);
    if current < width {
        output.push_str(&" ".repeat(width - current));
    }
    output
}

fn pad_left(value: &str, width: usize) -> String {
    let current = display_width(value);
    if current >= width {
        return value.to_string();
    }
    let mut output = " ".repeat(width - current);
    output.push_str(value);
    output
}
