use serde_json::Value;
use std::process::Command;

fn run_parley(args: &[&str], envs: &[(&str, &str)]) -> Value {
    let data_dir = std::env::temp_dir().join(format!("parley-doctor-{}", std::process::id()));
    let mut command = Command::new(env!("CARGO_BIN_EXE_parley"));
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("PARLEY_") {
            command.env_remove(&key);
        }
    }
    let output = command
        .args(args)
        .env("PARLEY_DATA_DIR", &data_dir)
        .envs(envs.iter().copied())
        .output()
        .expect("failed to execute parley binary");

    assert!(
        output.status.success(),
        "parley failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    serde_json::from_slice(&output.stdout).expect("stdout should be valid json")
}

#[test]
fn doctor_reports_resolved_config() {
    let value = run_parley(&["doctor", "--json"], &[]);
    let Some(url) = value["config"]["apiBaseUrl"].as_str() else {
        panic!("expected string url, got {value}");
    };
    assert!(url.starts_with("http"));
    assert_eq!(value["config"]["pollInterval"], 3000);
    assert_eq!(value["sessionStored"], false);
    assert!(value["user"].is_null());
}

#[test]
fn doctor_honors_environment_overrides() {
    let value = run_parley(
        &["doctor", "--compact"],
        &[
            ("PARLEY_API_BASE_URL", "http://chat.test/"),
            ("PARLEY_POLL_INTERVAL_MS", "50"),
        ],
    );
    assert_eq!(value["config"]["apiBaseUrl"], "http://chat.test");
    assert_eq!(value["config"]["messagesUrl"], "http://chat.test/messages");
    assert_eq!(value["config"]["pollInterval"], 250);
}
