use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

const DEFAULT_UPLOAD_URL: &str = "https://tmpfiles.org/api/v1/upload";
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const MIN_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_base_url: String,
    pub auth_url: String,
    pub users_url: String,
    pub messages_url: String,
    pub groups_url: String,
    pub upload_url: String,
    #[serde(serialize_with = "serialize_millis")]
    pub poll_interval: Duration,
    #[serde(serialize_with = "serialize_millis")]
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
    pub state_path: PathBuf,
    pub moderator_username: Option<String>,
    pub bell_enabled: bool,
}

impl Config {
    pub fn load() -> Self {
        let debug = cfg!(debug_assertions);
        let api_base_url = env::var("PARLEY_API_BASE_URL").unwrap_or_else(|_| {
            if debug {
                "http://localhost:8000".to_string()
            } else {
                "https://api.parley.chat".to_string()
            }
        });
        let api_base_url = api_base_url.trim_end_matches('/').to_string();

        let endpoint = |var: &str, path: &str| {
            env::var(var)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| format!("{api_base_url}/{path}"))
        };
        let auth_url = endpoint("PARLEY_AUTH_URL", "auth");
        let users_url = endpoint("PARLEY_USERS_URL", "users");
        let messages_url = endpoint("PARLEY_MESSAGES_URL", "messages");
        let groups_url = endpoint("PARLEY_GROUPS_URL", "groups");
        let upload_url = env::var("PARLEY_UPLOAD_URL").unwrap_or_else(|_| DEFAULT_UPLOAD_URL.to_string());

        let poll_interval_ms = env_u64("PARLEY_POLL_INTERVAL_MS")
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(MIN_POLL_INTERVAL_MS);
        let request_timeout_secs =
            env_u64("PARLEY_REQUEST_TIMEOUT_SECS").unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS).max(1);

        let data_dir = env::var("PARLEY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir(debug));
        let state_path = env::var("PARLEY_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("session.json"));

        let moderator_username = env::var("PARLEY_MODERATOR_USERNAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let bell_enabled = !env::var("PARLEY_NO_BELL").map(|value| is_truthy(&value)).unwrap_or(false);

        Self {
            api_base_url,
            auth_url,
            users_url,
            messages_url,
            groups_url,
            upload_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            data_dir,
            state_path,
            moderator_username,
            bell_enabled,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_data_dir(debug: bool) -> PathBuf {
    let base = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let dir_name = if debug { "parley-dev" } else { "parley" };
    base.join(".local").join("share").join(dir_name)
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}
