//! Configuration file loading tests

use chatpipe::config::{BusKind, ConfigError, PipelineConfig};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_minimal_config_with_defaults() {
    let file = write_config(
        r#"
[pipeline]
id = "chatpipe-dev"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "You are a helpful hotel booking assistant."
"#,
    );

    let config = PipelineConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.pipeline.id, "chatpipe-dev");
    assert_eq!(config.pipeline.bus, BusKind::Memory);
    assert_eq!(config.pipeline.completion_timeout_secs, 30);
    assert_eq!(config.http.port, 8080);
}

#[test]
fn loads_mqtt_config() {
    let file = write_config(
        r#"
[pipeline]
id = "chatpipe-prod"
bus = "mqtt"

[mqtt]
broker_url = "mqtts://broker.example.com"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "Be helpful."

[telegram]
bot_token_env = "TELEGRAM_BOT_TOKEN"
"#,
    );

    let config = PipelineConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.pipeline.bus, BusKind::Mqtt);
    let mqtt = config.mqtt.unwrap();
    assert_eq!(mqtt.broker_url, "mqtts://broker.example.com");
    assert_eq!(mqtt.keep_alive_secs, 60);
    assert_eq!(
        config.telegram.unwrap().bot_token_env,
        "TELEGRAM_BOT_TOKEN"
    );
}

#[test]
fn rejects_mqtt_bus_without_mqtt_section() {
    let file = write_config(
        r#"
[pipeline]
id = "broken"
bus = "mqtt"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "Be helpful."
"#,
    );

    let result = PipelineConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn rejects_malformed_toml() {
    let file = write_config("this is not toml = = =");
    let result = PipelineConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn rejects_invalid_pipeline_id() {
    let file = write_config(
        r#"
[pipeline]
id = "bad id!"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
system_prompt = "Be helpful."
"#,
    );

    let result = PipelineConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidPipelineId(_))));
}

#[test]
fn missing_file_is_read_error() {
    let result = PipelineConfig::load_from_file(std::path::Path::new("/nonexistent/chatpipe.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}
