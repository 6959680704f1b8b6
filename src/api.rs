use std::future::Future;

use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::models::{Group, GroupId, GroupMember, Message, MessageId, User, UserId};
use crate::selector::Target;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("api error: {error} (HTTP {status})")]
    Api { status: u16, error: String },
    #[error("not found: {0}")]
    NotFound(String),
}

/// Outbound payload shared by the direct and group send endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub voice_url: Option<String>,
    pub voice_duration: Option<u32>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    fn insert_into(&self, payload: &mut serde_json::Map<String, Value>) {
        payload.insert("content".to_string(), json!(self.content));
        if let Some(file_url) = &self.file_url {
            payload.insert("file_url".to_string(), json!(file_url));
        }
        if let Some(file_name) = &self.file_name {
            payload.insert("file_name".to_string(), json!(file_name));
        }
        if let Some(voice_url) = &self.voice_url {
            payload.insert("voice_url".to_string(), json!(voice_url));
        }
        if let Some(voice_duration) = self.voice_duration {
            payload.insert("voice_duration".to_string(), json!(voice_duration));
        }
    }
}

/// The part of the remote store the sync engine and composer rely on.
pub trait MessageStore: Send + Sync {
    /// Full message list for `target` as visible to `me`, oldest first.
    fn fetch_timeline(
        &self,
        me: UserId,
        target: Target,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    fn send_message(
        &self,
        me: UserId,
        target: Target,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Clone)]
pub struct ApiClient {
    auth_url: String,
    users_url: String,
    messages_url: String,
    groups_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            auth_url: config.auth_url.clone(),
            users_url: config.users_url.clone(),
            messages_url: config.messages_url.clone(),
            groups_url: config.groups_url.clone(),
            http,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("login"));
        payload.insert("username".to_string(), json!(username));
        payload.insert("password".to_string(), json!(password));
        let response: AuthResponse = self.post(&self.auth_url, payload).await?;
        response.into_user()
    }

    pub async fn register(&self, username: &str, password: &str, bio: Option<&str>) -> Result<User, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("register"));
        payload.insert("username".to_string(), json!(username));
        payload.insert("password".to_string(), json!(password));
        if let Some(bio) = bio {
            payload.insert("bio".to_string(), json!(bio));
        }
        let response: AuthResponse = self.post(&self.auth_url, payload).await?;
        response.into_user()
    }

    pub async fn list_users(&self, search: Option<&str>) -> Result<Vec<User>, ApiError> {
        let mut query = Vec::new();
        if let Some(search) = search.map(str::trim).filter(|value| !value.is_empty()) {
            query.push(("search", search.to_string()));
        }
        let response: UsersResponse = self.get(&self.users_url, &query).await?;
        Ok(response.users)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User, ApiError> {
        let response: UsersResponse = self
            .get(&self.users_url, &[("user_id", user_id.to_string())])
            .await?;
        response
            .users
            .into_iter()
            .find(|user| user.id == user_id)
            .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<User>, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("update_profile"));
        payload.insert("user_id".to_string(), json!(user_id));
        payload.insert("bio".to_string(), json!(bio));
        payload.insert("avatar_url".to_string(), json!(avatar_url));
        let response: AuthResponse = self.post(&self.users_url, payload).await?;
        Ok(response.user)
    }

    pub async fn update_status(&self, user_id: UserId, status: &str) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("update_status"));
        payload.insert("user_id".to_string(), json!(user_id));
        payload.insert("status".to_string(), json!(status));
        let _: Ack = self.post(&self.users_url, payload).await?;
        Ok(())
    }

    pub async fn report_user(&self, reporter_id: UserId, reported_user_id: UserId, reason: &str) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("report_user"));
        payload.insert("reporter_id".to_string(), json!(reporter_id));
        payload.insert("reported_user_id".to_string(), json!(reported_user_id));
        payload.insert("reason".to_string(), json!(reason));
        let _: Ack = self.post(&self.users_url, payload).await?;
        Ok(())
    }

    pub async fn direct_messages(&self, user_id: UserId, contact_id: UserId) -> Result<Vec<Message>, ApiError> {
        let response: MessagesResponse = self
            .get(
                &self.messages_url,
                &[("user_id", user_id.to_string()), ("contact_id", contact_id.to_string())],
            )
            .await?;
        Ok(response.messages)
    }

    pub async fn send_direct(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        message: &OutboundMessage,
    ) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("send"));
        payload.insert("sender_id".to_string(), json!(sender_id));
        payload.insert("receiver_id".to_string(), json!(receiver_id));
        message.insert_into(&mut payload);
        let _: Ack = self.post(&self.messages_url, payload).await?;
        Ok(())
    }

    pub async fn mark_read(&self, message_ids: &[MessageId]) -> Result<(), ApiError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("mark_read"));
        payload.insert("message_ids".to_string(), json!(message_ids));
        let _: Ack = self.post(&self.messages_url, payload).await?;
        Ok(())
    }

    pub async fn list_groups(&self, user_id: UserId) -> Result<Vec<Group>, ApiError> {
        let response: GroupsResponse = self
            .get(&self.groups_url, &[("user_id", user_id.to_string())])
            .await?;
        Ok(response.groups)
    }

    pub async fn create_group(&self, created_by: UserId, name: &str, description: &str) -> Result<Group, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("create"));
        payload.insert("name".to_string(), json!(name));
        payload.insert("description".to_string(), json!(description));
        payload.insert("created_by".to_string(), json!(created_by));
        let response: GroupResponse = self.post(&self.groups_url, payload).await?;
        Ok(response.group)
    }

    pub async fn update_group(&self, group_id: GroupId, name: &str, description: &str) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("update"));
        payload.insert("group_id".to_string(), json!(group_id));
        payload.insert("name".to_string(), json!(name));
        payload.insert("description".to_string(), json!(description));
        let _: Ack = self.post(&self.groups_url, payload).await?;
        Ok(())
    }

    pub async fn add_member(&self, group_id: GroupId, user_id: UserId) -> Result<(), ApiError> {
        self.member_action("add_member", group_id, user_id).await
    }

    pub async fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Result<(), ApiError> {
        self.member_action("remove_member", group_id, user_id).await
    }

    pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<GroupMember>, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("get_members"));
        payload.insert("group_id".to_string(), json!(group_id));
        let response: MembersResponse = self.post(&self.groups_url, payload).await?;
        Ok(response.members)
    }

    pub async fn group_messages(&self, group_id: GroupId, user_id: UserId) -> Result<Vec<Message>, ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("get_messages"));
        payload.insert("group_id".to_string(), json!(group_id));
        payload.insert("user_id".to_string(), json!(user_id));
        let response: MessagesResponse = self.post(&self.groups_url, payload).await?;
        Ok(response.messages)
    }

    pub async fn send_group_message(
        &self,
        group_id: GroupId,
        sender_id: UserId,
        message: &OutboundMessage,
    ) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!("send_message"));
        payload.insert("group_id".to_string(), json!(group_id));
        payload.insert("sender_id".to_string(), json!(sender_id));
        message.insert_into(&mut payload);
        let _: Ack = self.post(&self.groups_url, payload).await?;
        Ok(())
    }

    async fn member_action(&self, action: &str, group_id: GroupId, user_id: UserId) -> Result<(), ApiError> {
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_string(), json!(action));
        payload.insert("group_id".to_string(), json!(group_id));
        payload.insert("user_id".to_string(), json!(user_id));
        let _: Ack = self.post(&self.groups_url, payload).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, ApiError> {
        let url = Url::parse_with_params(url, query)?;
        let response = self.http.get(url).send().await?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: serde_json::Map<String, Value>,
    ) -> Result<T, ApiError> {
        let response = self.http.post(url).json(&payload).send().await?;
        decode(response).await
    }
}

impl MessageStore for ApiClient {
    async fn fetch_timeline(&self, me: UserId, target: Target) -> Result<Vec<Message>, ApiError> {
        match target {
            Target::Direct(peer) => self.direct_messages(me, peer).await,
            Target::Group(group) => self.group_messages(group, me).await,
        }
    }

    async fn send_message(&self, me: UserId, target: Target, message: &OutboundMessage) -> Result<(), ApiError> {
        match target {
            Target::Direct(peer) => self.send_direct(me, peer, message).await,
            Target::Group(group) => self.send_group_message(group, me, message).await,
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.json::<ErrorBody>().await.ok();
        return Err(match body.and_then(|body| body.error) {
            Some(error) => ApiError::Api {
                status: status.as_u16(),
                error,
            },
            None => ApiError::Status(status.as_u16()),
        });
    }
    let value: Value = response.json().await?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ApiError::Api {
            status: status.as_u16(),
            error: error.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|err| ApiError::Api {
        status: status.as_u16(),
        error: format!("malformed response: {err}"),
    })
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[allow(dead_code)]
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    user: Option<User>,
}

impl AuthResponse {
    fn into_user(self) -> Result<User, ApiError> {
        self.user
            .ok_or_else(|| ApiError::NotFound("user in auth response".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
struct GroupResponse {
    group: Group,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<GroupMember>,
}
