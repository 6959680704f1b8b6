mod api;
mod chat;
mod composer;
mod config;
mod dates;
mod models;
mod notify;
mod output;
mod selector;
mod session;
mod sync;
mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::{Input, Password};
use serde::Serialize;

use crate::api::{ApiClient, MessageStore, OutboundMessage};
use crate::composer::{MessageComposer, SendOutcome};
use crate::config::Config;
use crate::models::{GroupId, User, UserId};
use crate::notify::TerminalBell;
use crate::output::{GroupListOutput, JsonFormat, MemberListOutput, UserListOutput};
use crate::selector::{ConversationSelector, Target};
use crate::session::SessionStore;
use crate::sync::SyncEngine;
use crate::upload::{AttachmentUploader, UploadFile, Uploader};

#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Parley messenger CLI",
    after_help = "Examples:\n  parley auth login --username alice\n  parley users list --search bo\n  parley groups list\n  parley messages list --user-id 42\n  parley messages send --group-id 7 --text \"hello\"\n  parley messages send --user-id 42 --attach ./photo.jpg\n  parley messages send --user-id 42 --voice ./note.webm --duration 9\n  parley chat --group-id 7"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Output JSON instead of a table")]
    json: bool,

    #[arg(long, global = true, help = "Print compact JSON (implies --json)")]
    compact: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Sign in, register or sign out")]
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    #[command(about = "Search users and manage your profile")]
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    #[command(about = "List and manage groups")]
    Groups {
        #[command(subcommand)]
        command: GroupsCommand,
    },
    #[command(about = "Read and send messages")]
    Messages {
        #[command(subcommand)]
        command: MessagesCommand,
    },
    #[command(about = "Open an interactive conversation that refreshes by polling")]
    Chat(ConversationArgs),
    #[command(about = "Print resolved configuration and session status")]
    Doctor,
}

#[derive(Subcommand)]
enum AuthCommand {
    #[command(about = "Log in with username and password")]
    Login(AuthLoginArgs),
    #[command(about = "Create an account and log in")]
    Register(AuthRegisterArgs),
    #[command(about = "Mark yourself offline and forget the stored session")]
    Logout,
    #[command(about = "Show the signed-in user")]
    Whoami,
}

#[derive(Args)]
struct AuthLoginArgs {
    #[arg(long, help = "Username (prompted if omitted)")]
    username: Option<String>,

    #[arg(long, help = "Password (prompted if omitted)")]
    password: Option<String>,
}

#[derive(Args)]
struct AuthRegisterArgs {
    #[arg(long, help = "Username (prompted if omitted)")]
    username: Option<String>,

    #[arg(long, help = "Password (prompted if omitted)")]
    password: Option<String>,

    #[arg(long, help = "Short profile bio")]
    bio: Option<String>,
}

#[derive(Subcommand)]
enum UsersCommand {
    #[command(about = "List users, optionally filtered by a search term")]
    List(UsersListArgs),
    #[command(about = "Fetch a user by id")]
    Get(UserIdArgs),
    #[command(about = "Update your bio or avatar URL")]
    UpdateProfile(UpdateProfileArgs),
    #[command(about = "Upload an image and use it as your avatar")]
    Avatar(AvatarArgs),
    #[command(about = "Report a user to the moderators")]
    Report(ReportArgs),
}

#[derive(Args)]
struct UsersListArgs {
    #[arg(long, help = "Search term matched against usernames")]
    search: Option<String>,
}

#[derive(Args)]
struct UserIdArgs {
    #[arg(long, help = "User id")]
    id: UserId,
}

#[derive(Args)]
struct UpdateProfileArgs {
    #[arg(long, help = "New bio")]
    bio: Option<String>,

    #[arg(long, help = "New avatar URL")]
    avatar_url: Option<String>,
}

#[derive(Args)]
struct AvatarArgs {
    #[arg(long, value_name = "PATH", help = "Image file to upload")]
    file: PathBuf,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long, help = "User id to report")]
    id: UserId,

    #[arg(long, help = "Reason (prompted if omitted)")]
    reason: Option<String>,
}

#[derive(Subcommand)]
enum GroupsCommand {
    #[command(about = "List groups you belong to")]
    List,
    #[command(about = "Create a group and optionally add members")]
    Create(GroupCreateArgs),
    #[command(about = "Rename a group or change its description")]
    Update(GroupUpdateArgs),
    #[command(about = "List members of a group")]
    Members(GroupIdArgs),
    #[command(about = "Add a user to a group")]
    AddMember(GroupMemberArgs),
    #[command(about = "Remove a user from a group")]
    RemoveMember(GroupMemberArgs),
}

#[derive(Args)]
struct GroupCreateArgs {
    #[arg(long, help = "Group name")]
    name: String,

    #[arg(long, default_value = "", help = "Group description")]
    description: String,

    #[arg(
        long = "member",
        value_name = "USER_ID",
        action = ArgAction::Append,
        help = "User id to add after creation. Repeatable."
    )]
    members: Vec<UserId>,
}

#[derive(Args)]
struct GroupUpdateArgs {
    #[arg(long, help = "Group id")]
    id: GroupId,

    #[arg(long, help = "New group name")]
    name: String,

    #[arg(long, help = "New description (keeps the current one if omitted)")]
    description: Option<String>,
}

#[derive(Args)]
struct GroupIdArgs {
    #[arg(long, help = "Group id")]
    id: GroupId,
}

#[derive(Args)]
struct GroupMemberArgs {
    #[arg(long, help = "Group id")]
    group_id: GroupId,

    #[arg(long, help = "User id")]
    user_id: UserId,
}

#[derive(Subcommand)]
enum MessagesCommand {
    #[command(about = "List messages for a direct conversation or group")]
    List(ConversationArgs),
    #[command(about = "Send a text, attachment or voice message")]
    Send(MessagesSendArgs),
}

#[derive(Args)]
struct ConversationArgs {
    #[arg(long, help = "User id (direct conversation)")]
    user_id: Option<UserId>,

    #[arg(long, help = "Group id")]
    group_id: Option<GroupId>,
}

#[derive(Args)]
struct MessagesSendArgs {
    #[command(flatten)]
    conversation: ConversationArgs,

    #[arg(long, help = "Message text")]
    text: Option<String>,

    #[arg(
        long = "attach",
        alias = "file",
        value_name = "PATH",
        action = ArgAction::Append,
        help = "Attachment path. Repeatable; each file is sent as its own message."
    )]
    attachments: Vec<PathBuf>,

    #[arg(long, value_name = "PATH", requires = "duration", help = "Recorded voice clip (webm)")]
    voice: Option<PathBuf>,

    #[arg(long, value_name = "SECS", requires = "voice", help = "Voice clip length in seconds")]
    duration: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DoctorOutput<'a> {
    config: &'a Config,
    session_path: &'a Path,
    session_stored: bool,
    user: Option<User>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let env_filter = std::env::var("PARLEY_LOG")
        .ok()
        .and_then(|value| tracing_subscriber::EnvFilter::try_new(value).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load();
    let session = SessionStore::new(config.state_path.clone(), config.api_base_url.clone());
    let api = Arc::new(ApiClient::new(&config)?);
    let json = cli.json || cli.compact;
    let json_format = output::resolve_json_format(cli.compact);
    tracing::debug!(api = %config.api_base_url, "starting");

    match cli.command {
        Command::Auth { command } => match command {
            AuthCommand::Login(args) => {
                let username = prompt_if_missing(args.username, "Username")?;
                let password = password_if_missing(args.password)?;
                let user = api.login(&username, &password).await?;
                signed_in(&api, &session, &user).await?;
                if json {
                    output::print_json(&user, json_format)?;
                } else {
                    println!("Logged in as {} (id {}).", user.username, user.id);
                }
            }
            AuthCommand::Register(args) => {
                let username = prompt_if_missing(args.username, "Username")?;
                let password = password_if_missing(args.password)?;
                let user = api.register(&username, &password, args.bio.as_deref()).await?;
                signed_in(&api, &session, &user).await?;
                if json {
                    output::print_json(&user, json_format)?;
                } else {
                    println!("Registered and logged in as {} (id {}).", user.username, user.id);
                }
            }
            AuthCommand::Logout => {
                if let Some(user) = session.load()? {
                    if let Err(err) = api.update_status(user.id, "offline").await {
                        tracing::warn!(error = %err, "could not mark user offline");
                    }
                }
                session.clear()?;
                println!("Logged out.");
            }
            AuthCommand::Whoami => {
                let me = require_user(&session)?;
                output::print_user(&me, json, json_format)?;
            }
        },
        Command::Users { command } => match command {
            UsersCommand::List(args) => {
                require_user(&session)?;
                let users = api.list_users(args.search.as_deref()).await?;
                output::print_users(&UserListOutput { users }, json, json_format)?;
            }
            UsersCommand::Get(args) => {
                require_user(&session)?;
                let user = api.get_user(args.id).await?;
                output::print_user(&user, json, json_format)?;
            }
            UsersCommand::UpdateProfile(args) => {
                let me = require_user(&session)?;
                if args.bio.is_none() && args.avatar_url.is_none() {
                    return Err("Provide --bio and/or --avatar-url".into());
                }
                let bio = args.bio.or_else(|| me.bio.clone());
                let avatar_url = args.avatar_url.or_else(|| me.avatar_url.clone());
                let user = update_profile(&api, &session, &me, bio, avatar_url).await?;
                output::print_user(&user, json, json_format)?;
            }
            UsersCommand::Avatar(args) => {
                let me = require_user(&session)?;
                let uploader = AttachmentUploader::new(&config)?;
                let file = UploadFile::from_path(&args.file).await?;
                if !file.mime_type.as_deref().is_some_and(|mime| mime.starts_with("image/")) {
                    return Err(format!("{} is not an image", args.file.display()).into());
                }
                let url = uploader.upload(file).await?;
                let user = update_profile(&api, &session, &me, me.bio.clone(), Some(url)).await?;
                output::print_user(&user, json, json_format)?;
            }
            UsersCommand::Report(args) => {
                let me = require_user(&session)?;
                if args.id == me.id {
                    return Err("You cannot report yourself".into());
                }
                let reason = prompt_if_missing(args.reason, "Reason")?;
                api.report_user(me.id, args.id, &reason).await?;
                if let Some(moderator) = config.moderator_username.as_deref() {
                    if let Err(err) = notify_moderator(&api, &me, moderator, args.id, &reason).await {
                        eprintln!("Report stored, but the moderator could not be messaged: {err}");
                    }
                }
                println!("Report submitted.");
            }
        },
        Command::Groups { command } => match command {
            GroupsCommand::List => {
                let me = require_user(&session)?;
                let groups = api.list_groups(me.id).await?;
                output::print_groups(&GroupListOutput { groups }, json, json_format)?;
            }
            GroupsCommand::Create(args) => {
                let me = require_user(&session)?;
                let name = args.name.trim();
                if name.is_empty() {
                    return Err("Group name cannot be empty".into());
                }
                let group = api.create_group(me.id, name, args.description.trim()).await?;
                for member in args.members.into_iter().filter(|member| *member != me.id) {
                    api.add_member(group.id, member).await?;
                }
                output::print_group(&group, json, json_format)?;
            }
            GroupsCommand::Update(args) => {
                let me = require_user(&session)?;
                let name = args.name.trim();
                if name.is_empty() {
                    return Err("Group name cannot be empty".into());
                }
                let description = match args.description {
                    Some(description) => description,
                    None => api
                        .list_groups(me.id)
                        .await?
                        .into_iter()
                        .find(|group| group.id == args.id)
                        .and_then(|group| group.description)
                        .unwrap_or_default(),
                };
                api.update_group(args.id, name, description.trim()).await?;
                println!("Group {} updated.", args.id);
            }
            GroupsCommand::Members(args) => {
                require_user(&session)?;
                let members = api.group_members(args.id).await?;
                let listing = MemberListOutput {
                    group_id: args.id,
                    members,
                };
                output::print_members(&listing, json, json_format)?;
            }
            GroupsCommand::AddMember(args) => {
                require_user(&session)?;
                api.add_member(args.group_id, args.user_id).await?;
                println!("Added user {} to group {}.", args.user_id, args.group_id);
            }
            GroupsCommand::RemoveMember(args) => {
                require_user(&session)?;
                api.remove_member(args.group_id, args.user_id).await?;
                println!("Removed user {} from group {}.", args.user_id, args.group_id);
            }
        },
        Command::Messages { command } => match command {
            MessagesCommand::List(args) => {
                let me = require_user(&session)?;
                let target = target_from_args(&args)?;
                let messages = api.fetch_timeline(me.id, target).await?;
                let timeline = output::timeline_output(target, &messages, me.id, Utc::now());
                output::print_timeline(&timeline, json, json_format)?;
            }
            MessagesCommand::Send(args) => {
                let me = require_user(&session)?;
                send_messages(&config, &api, &me, args, json, json_format).await?;
            }
        },
        Command::Chat(args) => {
            let me = require_user(&session)?;
            let target = target_from_args(&args)?;
            chat::run_chat(&config, api, &me, target).await?;
        }
        Command::Doctor => {
            let user = session.load().ok().flatten();
            let report = DoctorOutput {
                config: &config,
                session_path: session.path(),
                session_stored: user.is_some(),
                user,
            };
            if json {
                output::print_json(&report, json_format)?;
            } else {
                println!("API base URL:   {}", config.api_base_url);
                println!("Upload URL:     {}", config.upload_url);
                println!("Poll interval:  {} ms", config.poll_interval.as_millis());
                println!("Session file:   {}", session.path().display());
                match &report.user {
                    Some(user) => println!("Signed in as:   {} (id {})", user.username, user.id),
                    None => println!("Signed in as:   -"),
                }
            }
        }
    }

    Ok(())
}

async fn send_messages(
    config: &Config,
    api: &Arc<ApiClient>,
    me: &User,
    args: MessagesSendArgs,
    json: bool,
    json_format: JsonFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = target_from_args(&args.conversation)?;
    let text = args.text.as_deref().filter(|text| !text.trim().is_empty());
    if text.is_none() && args.attachments.is_empty() && args.voice.is_none() {
        return Err("Provide --text, --attach or --voice".into());
    }

    let selector = Arc::new(ConversationSelector::new());
    let engine = Arc::new(SyncEngine::new(
        me.id,
        Arc::clone(api),
        TerminalBell::new(false),
        config.poll_interval,
    ));
    let composer = MessageComposer::new(
        me.id,
        Arc::clone(api),
        AttachmentUploader::new(config)?,
        Arc::clone(&selector),
        Arc::clone(&engine),
    );
    // the engine polls the target so each send refreshes a real timeline
    engine.apply(selector.select(target));
    let sent = send_all(&composer, &args, text, json).await;
    let messages = engine.timeline().len();
    engine.stop();
    let sent = sent?;

    if json {
        output::print_json(
            &serde_json::json!({ "conversation": target, "sent": sent, "messages": messages }),
            json_format,
        )?;
    } else {
        println!("Sent {sent} message(s) to {target}; {messages} in conversation.");
    }
    Ok(())
}

async fn send_all(
    composer: &MessageComposer<ApiClient, AttachmentUploader, TerminalBell>,
    args: &MessagesSendArgs,
    text: Option<&str>,
    json: bool,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut sent = 0usize;
    for path in &args.attachments {
        let file = UploadFile::from_path(path).await?;
        if !json {
            eprintln!("Uploading {}...", file.file_name);
        }
        sent += sent_count(composer.send_attachment(file).await?);
    }
    if let (Some(path), Some(duration)) = (args.voice.as_deref(), args.duration) {
        let audio = tokio::fs::read(path).await?;
        sent += sent_count(composer.send_voice(audio, duration).await?);
    }
    if let Some(text) = text {
        sent += sent_count(composer.send_text(text).await?);
    }
    Ok(sent)
}

fn sent_count(outcome: SendOutcome) -> usize {
    match outcome {
        SendOutcome::Sent => 1,
        SendOutcome::Skipped(reason) => {
            eprintln!("Skipped: {}", chat::skip_message(reason));
            0
        }
    }
}

async fn signed_in(api: &ApiClient, session: &SessionStore, user: &User) -> Result<(), Box<dyn std::error::Error>> {
    session.save(user)?;
    if let Err(err) = api.update_status(user.id, "online").await {
        tracing::warn!(error = %err, "could not mark user online");
    }
    Ok(())
}

async fn update_profile(
    api: &ApiClient,
    session: &SessionStore,
    me: &User,
    bio: Option<String>,
    avatar_url: Option<String>,
) -> Result<User, Box<dyn std::error::Error>> {
    let updated = api
        .update_profile(me.id, bio.as_deref(), avatar_url.as_deref())
        .await?;
    let user = updated.unwrap_or_else(|| User {
        bio,
        avatar_url,
        ..me.clone()
    });
    session.save(&user)?;
    Ok(user)
}

async fn notify_moderator(
    api: &ApiClient,
    me: &User,
    moderator: &str,
    reported: UserId,
    reason: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let moderator = api
        .list_users(Some(moderator))
        .await?
        .into_iter()
        .find(|user| user.username == moderator)
        .ok_or_else(|| format!("moderator account {moderator} not found"))?;
    let message = OutboundMessage::text(format!("Report on user {reported}: {reason}"));
    api.send_direct(me.id, moderator.id, &message).await?;
    Ok(())
}

fn require_user(session: &SessionStore) -> Result<User, Box<dyn std::error::Error>> {
    match session.load()? {
        Some(user) => Ok(user),
        None => Err("Not logged in. Run `parley auth login` first.".into()),
    }
}

fn target_from_args(args: &ConversationArgs) -> Result<Target, Box<dyn std::error::Error>> {
    match (args.user_id, args.group_id) {
        (Some(_), Some(_)) => Err("Provide only one of --user-id or --group-id".into()),
        (Some(user_id), None) => Ok(Target::Direct(user_id)),
        (None, Some(group_id)) => Ok(Target::Group(group_id)),
        (None, None) => Err("Provide --user-id or --group-id".into()),
    }
}

fn prompt_if_missing(value: Option<String>, prompt: &str) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(value) = value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()) {
        return Ok(value);
    }
    let value: String = Input::new().with_prompt(prompt).interact_text()?;
    Ok(value.trim().to_string())
}

fn password_if_missing(value: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    match value.filter(|value| !value.is_empty()) {
        Some(value) => Ok(value),
        None => Ok(Password::new().with_prompt("Password").interact()?),
    }
}
