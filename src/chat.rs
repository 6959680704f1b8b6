//! Interactive terminal session: stdin commands in, rendered timeline out.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::api::ApiClient;
use crate::composer::{ComposeError, MessageComposer, SendOutcome, SkipReason};
use crate::config::Config;
use crate::models::{GroupId, MessageId, User, UserId};
use crate::notify::TerminalBell;
use crate::output;
use crate::selector::{ConversationSelector, Target};
use crate::sync::{SyncEngine, TimelineSnapshot};
use crate::upload::{AttachmentUploader, UploadFile};

const HISTORY_LINES: usize = 20;

type Composer = MessageComposer<ApiClient, AttachmentUploader, TerminalBell>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Empty,
    Text(String),
    File(PathBuf),
    Voice { path: PathBuf, seconds: u32 },
    SwitchUser(UserId),
    SwitchGroup(GroupId),
    Leave,
    Status,
    Refresh,
    Quit,
    Invalid(String),
}

pub fn parse_chat_input(line: &str) -> ChatInput {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return ChatInput::Text(trimmed.to_string());
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match name {
        "quit" | "q" => ChatInput::Quit,
        "refresh" => ChatInput::Refresh,
        "leave" => ChatInput::Leave,
        "status" => ChatInput::Status,
        "file" if !rest.is_empty() => ChatInput::File(PathBuf::from(rest)),
        "file" => ChatInput::Invalid("usage: /file PATH".to_string()),
        "voice" => match rest.rsplit_once(char::is_whitespace) {
            Some((path, seconds)) => match seconds.parse::<u32>() {
                Ok(seconds) => ChatInput::Voice {
                    path: PathBuf::from(path.trim()),
                    seconds,
                },
                Err(_) => ChatInput::Invalid(format!("invalid duration: {seconds}")),
            },
            None => ChatInput::Invalid("usage: /voice PATH SECONDS".to_string()),
        },
        "user" => match rest.parse() {
            Ok(id) => ChatInput::SwitchUser(id),
            Err(_) => ChatInput::Invalid("usage: /user ID".to_string()),
        },
        "group" => match rest.parse() {
            Ok(id) => ChatInput::SwitchGroup(id),
            Err(_) => ChatInput::Invalid("usage: /group ID".to_string()),
        },
        other => ChatInput::Invalid(format!("unknown command: /{other}")),
    }
}

pub fn skip_message(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::EmptyText => "nothing to send",
        SkipReason::NoActiveConversation => "no conversation selected (use /user ID or /group ID)",
        SkipReason::UploadInProgress => "an upload is already in progress",
    }
}

/// Prints each message of the active timeline once per conversation.
pub struct TimelineRenderer {
    me: UserId,
    epoch: u64,
    primed: bool,
    seen: HashSet<MessageId>,
}

impl TimelineRenderer {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            epoch: 0,
            primed: false,
            seen: HashSet::new(),
        }
    }

    /// Lines not yet shown for this snapshot's conversation, plus the ids of
    /// unread messages from others among them.
    pub fn render(&mut self, snapshot: &TimelineSnapshot) -> (Vec<String>, Vec<MessageId>) {
        let mut lines = Vec::new();
        if snapshot.epoch != self.epoch {
            self.epoch = snapshot.epoch;
            self.primed = false;
            self.seen.clear();
            if let Some(target) = snapshot.target {
                lines.push(format!("== {target} =="));
            }
        }

        // only the first merged poll of a conversation is history
        let first_fill = !self.primed && snapshot.fetched;
        if snapshot.fetched {
            self.primed = true;
        }
        let fresh: Vec<_> = snapshot
            .messages
            .iter()
            .filter(|message| !self.seen.contains(&message.id))
            .collect();
        let skip = if first_fill {
            fresh.len().saturating_sub(HISTORY_LINES)
        } else {
            0
        };
        if skip > 0 {
            lines.push(format!("({skip} earlier messages)"));
        }

        let now = Utc::now();
        let mut unread = Vec::new();
        for (index, message) in fresh.into_iter().enumerate() {
            self.seen.insert(message.id);
            if message.sender_id != self.me && message.is_read == Some(false) {
                unread.push(message.id);
            }
            if index >= skip {
                let summary = output::message_summary(message, self.me, now);
                lines.push(output::format_message_line(&summary));
            }
        }
        (lines, unread)
    }
}

/// `/status` report for the running session.
struct Status {
    active: Option<Target>,
    messages: usize,
    cursor: usize,
    polling: bool,
    uploading: bool,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.active {
            Some(target) => write!(f, "conversation: {target}")?,
            None => f.write_str("conversation: none")?,
        }
        write!(
            f,
            ", messages: {}, cursor: {}, polling: {}, uploading: {}",
            self.messages, self.cursor, self.polling, self.uploading
        )
    }
}

pub async fn run_chat(config: &Config, api: Arc<ApiClient>, me: &User, initial: Target) -> Result<(), Box<dyn Error>> {
    let selector = Arc::new(ConversationSelector::new());
    let engine = Arc::new(SyncEngine::new(
        me.id,
        Arc::clone(&api),
        TerminalBell::new(config.bell_enabled),
        config.poll_interval,
    ));
    let uploader = AttachmentUploader::new(config)?;
    let composer = Arc::new(MessageComposer::new(
        me.id,
        Arc::clone(&api),
        uploader,
        Arc::clone(&selector),
        Arc::clone(&engine),
    ));

    let mut snapshots = engine.subscribe();
    let follower = engine.follow(selector.subscribe());
    engine.apply(selector.select(initial));
    println!("Signed in as {}. Type /quit to exit.", me.username);

    let mut renderer = TimelineRenderer::new(me.id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let (rendered, unread) = renderer.render(&snapshot);
                for line in rendered {
                    println!("{line}");
                }
                if matches!(snapshot.target, Some(Target::Direct(_))) && !unread.is_empty() {
                    if let Err(err) = api.mark_read(&unread).await {
                        tracing::warn!(error = %err, "mark_read failed");
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_chat_input(&line) {
                    ChatInput::Empty => {}
                    ChatInput::Quit => break,
                    ChatInput::Invalid(message) => eprintln!("{message}"),
                    ChatInput::Refresh => {
                        engine.force_refresh().await;
                    }
                    ChatInput::SwitchUser(peer) => {
                        engine.apply(selector.select_direct(peer));
                    }
                    ChatInput::SwitchGroup(group) => {
                        engine.apply(selector.select_group(group));
                    }
                    ChatInput::Leave => {
                        engine.apply(selector.clear());
                    }
                    ChatInput::Status => {
                        let status = Status {
                            active: engine.active(),
                            messages: engine.timeline().len(),
                            cursor: engine.cursor(),
                            polling: engine.is_polling(),
                            uploading: composer.is_uploading(),
                        };
                        eprintln!("{status}");
                    }
                    ChatInput::Text(text) => {
                        composer.set_draft(text);
                        report(composer.send_draft().await);
                    }
                    ChatInput::File(path) => spawn_attachment(&composer, path),
                    ChatInput::Voice { path, seconds } => spawn_voice(&composer, path, seconds),
                }
            }
        }
    }

    follower.abort();
    engine.stop();
    if let Err(err) = api.update_status(me.id, "offline").await {
        tracing::debug!(error = %err, "status update on exit failed");
    }
    Ok(())
}

fn spawn_attachment(composer: &Arc<Composer>, path: PathBuf) {
    let composer = Arc::clone(composer);
    tokio::spawn(async move {
        match UploadFile::from_path(&path).await {
            Ok(file) => {
                eprintln!("Uploading {}...", file.file_name);
                report(composer.send_attachment(file).await);
            }
            Err(err) => eprintln!("{}: {err}", path.display()),
        }
    });
}

fn spawn_voice(composer: &Arc<Composer>, path: PathBuf, seconds: u32) {
    let composer = Arc::clone(composer);
    tokio::spawn(async move {
        match tokio::fs::read(&path).await {
            Ok(audio) => report(composer.send_voice(audio, seconds).await),
            Err(err) => eprintln!("{}: {err}", path.display()),
        }
    });
}

fn report(result: Result<SendOutcome, ComposeError>) {
    match result {
        Ok(SendOutcome::Sent) => {}
        Ok(SendOutcome::Skipped(reason)) => eprintln!("{}", skip_message(reason)),
        Err(err) => eprintln!("{err}"),
    }
}
