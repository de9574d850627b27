//! Configuration layering: defaults < file < environment.

use std::env;

use tempfile::TempDir;

use concord_app::config;

fn clear_concord_env() {
    let keys: Vec<String> = env::vars()
        .map(|(k, _)| k)
        .filter(|k| k.starts_with("CONCORD"))
        .collect();
    for key in keys {
        env::remove_var(key);
    }
}

/// One test function: the phases mutate process environment and must not
/// interleave with each other.
#[test]
fn precedence_follows_defaults_file_env() {
    let temp = TempDir::new().expect("temp dir");
    clear_concord_env();
    // Keep /etc lookups inside the sandbox.
    env::set_var("CONCORD_ETC_CONFIG_DIR", temp.path());

    // Phase 1: pure defaults.
    let cfg = config::load().expect("defaults load");
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.extraction.per_extractor_timeout_secs, 300);
    assert_eq!(cfg.extraction.job_timeout_secs, 600);
    assert_eq!(cfg.extraction.similarity_threshold, 0.90);
    assert_eq!(cfg.extraction.auto_merge_threshold, 0.95);
    assert_eq!(cfg.retention.completed_days, 7);
    assert_eq!(cfg.retention.failed_days, 30);
    assert_eq!(cfg.webhook.attempts, 3);
    assert_eq!(cfg.extraction.extractors.docling_binary, "docling");

    // Phase 2: explicit file overrides defaults.
    let file = temp.path().join("settings.toml");
    std::fs::write(
        &file,
        r#"
[server]
listen_addr = "0.0.0.0:9090"

[storage]
path = "/tmp/concord-test-data"

[extraction]
similarity_threshold = 0.85
default_strategy = "parallel_local"

[webhook]
attempts = 5
"#,
    )
    .expect("write settings");
    env::set_var("CONCORD_CONFIG_FILE", &file);

    let cfg = config::load().expect("file load");
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:9090");
    assert_eq!(cfg.extraction.similarity_threshold, 0.85);
    assert_eq!(cfg.webhook.attempts, 5);
    // Untouched keys keep their defaults.
    assert_eq!(cfg.extraction.job_timeout_secs, 600);

    // Phase 3: environment beats the file.
    env::set_var("CONCORD_SERVER__LISTEN_ADDR", "127.0.0.1:7000");
    env::set_var("CONCORD_EXTRACTION__JOB_TIMEOUT_SECS", "900");
    let cfg = config::load().expect("env load");
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:7000");
    assert_eq!(cfg.extraction.job_timeout_secs, 900);
    assert_eq!(cfg.extraction.similarity_threshold, 0.85);
    env::remove_var("CONCORD_SERVER__LISTEN_ADDR");
    env::remove_var("CONCORD_EXTRACTION__JOB_TIMEOUT_SECS");

    // Phase 4: invalid combinations are rejected after layering.
    std::fs::write(
        &file,
        r#"
[server]
listen_addr = "127.0.0.1:9090"

[storage]
path = "/tmp/concord-test-data"

[extraction]
similarity_threshold = 0.99
auto_merge_threshold = 0.95
"#,
    )
    .expect("write settings");
    assert!(config::load().is_err());

    std::fs::write(
        &file,
        r#"
[server]
listen_addr = "127.0.0.1:9090"

[storage]
path = "/tmp/concord-test-data"

[extraction]
default_policy = "majority_vote"
"#,
    )
    .expect("write settings");
    assert!(config::load().is_err());

    clear_concord_env();
}
