use clap::Parser;
use sita_ai::Provider;
use tempfile::tempdir;

use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn unit_first_load_persists_defaults() {
    let temp = tempdir().expect("tempdir");
    let (configuration, store) = Configuration::load_from_data_dir(temp.path()).expect("load");

    assert_eq!(configuration, Configuration::default());
    assert_eq!(configuration.provider, Provider::OpenAi);
    assert_eq!(configuration.model, "gpt-4o-mini");
    assert_eq!(configuration.temperature, 0.7);
    assert_eq!(configuration.max_tokens, 2000);
    assert!(temp.path().join(SETTINGS_DB_FILE_NAME).exists());
    assert_eq!(
        store.load_all().expect("load all").get(KEY_MODEL).map(String::as_str),
        Some("gpt-4o-mini")
    );
}

#[test]
fn functional_set_and_reload_round_trips() {
    let temp = tempdir().expect("tempdir");
    let (mut configuration, store) =
        Configuration::load_from_data_dir(temp.path()).expect("load");

    configuration.set(KEY_TEMPERATURE, "0.2").expect("temperature");
    configuration.set(KEY_MAX_TOKENS, "4096").expect("max tokens");
    configuration.set(KEY_MARKDOWN, "off").expect("markdown");
    configuration
        .set("agent.openai_api_key", "sk-test-1234567890")
        .expect("api key");
    configuration.save(&store).expect("save");

    let reloaded = Configuration::load(&store).expect("reload");
    assert_eq!(reloaded.temperature, 0.2);
    assert_eq!(reloaded.max_tokens, 4096);
    assert!(!reloaded.render_markdown);
    assert_eq!(
        reloaded
            .resolve_api_key_with(Provider::OpenAi, no_env)
            .map(|key| key.value),
        Some("sk-test-1234567890".to_string())
    );
}

#[test]
fn functional_switching_provider_resets_model() {
    let mut configuration = Configuration::default();
    configuration.set(KEY_MODEL, "gpt-4o").expect("model");

    let changed = configuration.set(KEY_PROVIDER, "gemini").expect("provider");

    assert_eq!(changed, vec![KEY_PROVIDER.to_string(), KEY_MODEL.to_string()]);
    assert_eq!(configuration.provider, Provider::Google);
    assert_eq!(configuration.model, Provider::Google.default_model());
    assert!(configuration.set(KEY_PROVIDER, "google").expect("same").is_empty());
}

#[test]
fn regression_stored_model_survives_reload_after_provider_switch() {
    let temp = tempdir().expect("tempdir");
    let (mut configuration, store) =
        Configuration::load_from_data_dir(temp.path()).expect("load");
    configuration.set(KEY_PROVIDER, "openrouter").expect("provider");
    configuration
        .set(KEY_MODEL, "anthropic/claude-3.5-sonnet")
        .expect("model");
    configuration.save(&store).expect("save");

    let reloaded = Configuration::load(&store).expect("reload");
    assert_eq!(reloaded.provider, Provider::OpenRouter);
    assert_eq!(reloaded.model, "anthropic/claude-3.5-sonnet");
}

#[test]
fn unit_set_rejects_unknown_keys_and_bad_values() {
    let mut configuration = Configuration::default();

    assert!(matches!(
        configuration.set("agent.colour", "blue"),
        Err(ConfigError::UnknownKey(key)) if key == "agent.colour"
    ));
    assert!(matches!(
        configuration.set(KEY_TEMPERATURE, "3.5"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        configuration.set(KEY_MAX_TOKENS, "0"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        configuration.set(KEY_PROVIDER, "anthropic"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        configuration.set(KEY_SHOW_TOOL_CALLS, "maybe"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        configuration.set(KEY_MODEL, "two words"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert_eq!(configuration, Configuration::default());
}

#[test]
fn regression_invalid_stored_values_fall_back_to_defaults() {
    let temp = tempdir().expect("tempdir");
    let store = SettingsStore::open(temp.path().join(SETTINGS_DB_FILE_NAME)).expect("open");
    store
        .write_changes([
            (KEY_TEMPERATURE, Some("hot".to_string())),
            (KEY_MAX_TOKENS, Some("128".to_string())),
            ("legacy.theme", Some("dark".to_string())),
        ])
        .expect("seed");

    let configuration = Configuration::load(&store).expect("load");

    assert_eq!(configuration.temperature, 0.7);
    assert_eq!(configuration.max_tokens, 128);
}

#[test]
fn unit_api_key_resolution_prefers_setting_over_environment() {
    let mut configuration = Configuration::default();
    let env = |name: &str| (name == "OPENAI_API_KEY").then(|| "sk-from-env-0000".to_string());

    let from_env = configuration
        .resolve_api_key_with(Provider::OpenAi, env)
        .expect("env key");
    assert_eq!(from_env.source, ApiKeySource::Environment("OPENAI_API_KEY"));

    configuration
        .set("agent.openai_api_key", "sk-stored-9999")
        .expect("set");
    let stored = configuration
        .resolve_api_key_with(Provider::OpenAi, env)
        .expect("stored key");
    assert_eq!(stored.value, "sk-stored-9999");
    assert_eq!(stored.source, ApiKeySource::Setting);

    assert!(configuration
        .resolve_api_key_with(Provider::Together, no_env)
        .is_none());
}

#[test]
fn unit_entries_mask_api_keys() {
    let mut configuration = Configuration::default();
    configuration
        .set("agent.google_api_key", "AIzaSyExampleSecret1234")
        .expect("set");

    let entries = configuration.entries_with(no_env);
    let google = entries
        .iter()
        .find(|entry| entry.key == "agent.google_api_key")
        .expect("google entry");
    assert_eq!(google.value, "AIz...1234");
    assert!(!entries
        .iter()
        .any(|entry| entry.value.contains("ExampleSecret")));
    let openai = entries
        .iter()
        .find(|entry| entry.key == "agent.openai_api_key")
        .expect("openai entry");
    assert_eq!(openai.value, "(not set)");
    assert_eq!(entries.len(), known_keys().len());
}

#[test]
fn unit_mask_secret_hides_short_values_entirely() {
    assert_eq!(mask_secret("abc"), "****");
    assert_eq!(mask_secret("12345678"), "****");
    assert_eq!(mask_secret("sk-abcdefgh1234"), "sk-...1234");
}

#[test]
fn functional_cli_overrides_are_not_persisted() {
    let temp = tempdir().expect("tempdir");
    let (mut configuration, store) =
        Configuration::load_from_data_dir(temp.path()).expect("load");
    let cli = Cli::try_parse_from([
        "sita",
        "--provider",
        "together",
        "--temperature",
        "0.1",
    ])
    .expect("parse");

    configuration.apply_cli_overrides(&cli);

    assert_eq!(configuration.provider, Provider::Together);
    assert_eq!(configuration.model, Provider::Together.default_model());
    assert_eq!(configuration.temperature, 0.1);
    let reloaded = Configuration::load(&store).expect("reload");
    assert_eq!(reloaded.provider, Provider::OpenAi);
    assert_eq!(reloaded.temperature, 0.7);
}

#[test]
fn regression_set_after_cli_overrides_persists_only_the_changed_key() {
    let temp = tempdir().expect("tempdir");
    let (mut configuration, store) =
        Configuration::load_from_data_dir(temp.path()).expect("load");
    let cli = Cli::try_parse_from([
        "sita",
        "--provider",
        "together",
        "--temperature",
        "0.1",
        "--max-tokens",
        "512",
    ])
    .expect("parse");
    configuration.apply_cli_overrides(&cli);

    let changed = configuration.set(KEY_MARKDOWN, "false").expect("set");
    configuration.persist_keys(&store, &changed).expect("persist");

    let reloaded = Configuration::load(&store).expect("reload");
    assert!(!reloaded.render_markdown);
    assert_eq!(reloaded.provider, Provider::OpenAi);
    assert_eq!(reloaded.model, Provider::OpenAi.default_model());
    assert_eq!(reloaded.temperature, 0.7);
    assert_eq!(reloaded.max_tokens, 2000);
    assert_eq!(configuration.provider, Provider::Together);
}

#[test]
fn regression_cleared_api_key_stays_cleared_after_reload() {
    let temp = tempdir().expect("tempdir");
    let (mut configuration, store) =
        Configuration::load_from_data_dir(temp.path()).expect("load");
    let key = api_key_setting(Provider::Google);
    let changed = configuration.set(key, "AIzaStoredKey12345").expect("set key");
    configuration.persist_keys(&store, &changed).expect("persist key");
    assert!(store.load_all().expect("load all").contains_key(key));

    let changed = configuration.set(key, "").expect("clear key");
    configuration.persist_keys(&store, &changed).expect("persist clear");

    assert!(!store.load_all().expect("load all").contains_key(key));
    let reloaded = Configuration::load(&store).expect("reload");
    assert_eq!(reloaded.resolve_api_key_with(Provider::Google, no_env), None);
}

#[test]
fn unit_snapshot_copies_current_values() {
    let mut configuration = Configuration::default();
    configuration.set(KEY_SHOW_TOOL_CALLS, "false").expect("set");
    let snapshot = configuration.snapshot();
    assert_eq!(snapshot.provider, "openai");
    assert_eq!(snapshot.model, "gpt-4o-mini");
    assert!(!snapshot.show_tool_calls);
    assert!(snapshot.render_markdown);
}
