//! Configuration file loading and environment override tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use voxloop::OrchestratorConfig;

#[test]
fn loads_toml_and_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxloop.toml");
    std::fs::write(
        &path,
        r#"
        [server]
        port = 9100

        [llm]
        model = "gpt-4o"
        temperature = 0.5

        [turn]
        initial_silence_debounce_ms = 500
        "#,
    )
    .unwrap();

    let config = OrchestratorConfig::load(&path).unwrap();
    assert!(config.server.port == 9100);
    assert!(config.llm.model == "gpt-4o");
    assert!(config.turn.initial_silence_debounce_ms == 500);
    // Untouched sections keep their defaults.
    assert!(config.turn.max_silence_debounce_ms == 1_200);
    assert!(config.stt.sample_rate == 16_000);
}

#[test]
fn rejects_out_of_range_tuning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxloop.toml");
    std::fs::write(
        &path,
        r#"
        [turn]
        cancellation_rate_threshold = 0.9
        "#,
    )
    .unwrap();

    assert!(OrchestratorConfig::load(&path).is_err());
}

#[test]
fn rejects_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxloop.toml");
    std::fs::write(&path, "this is not toml [").unwrap();
    assert!(OrchestratorConfig::load(&path).is_err());
}

#[test]
fn env_credentials_override_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxloop.toml");
    std::fs::write(
        &path,
        r#"
        [llm]
        api_key = "file-key"
        "#,
    )
    .unwrap();

    // SAFETY: test-local env mutation; no other thread in this test binary
    // reads this variable concurrently.
    unsafe {
        std::env::set_var("VOXLOOP_LLM_API_KEY", "env-key");
    }
    let config = OrchestratorConfig::load(&path).unwrap();
    unsafe {
        std::env::remove_var("VOXLOOP_LLM_API_KEY");
    }
    assert!(config.llm.api_key == "env-key");
}
