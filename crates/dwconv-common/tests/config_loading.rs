//! Loading `DepthwiseConfig` from TOML files and `DWCONV_*` overrides.

use dwconv_common::{DEFAULT_WORKSPACE_LIMIT_BYTES, DepthwiseConfig, DepthwiseError};
use serial_test::serial;
use std::io::Write;

const ENV_KEYS: [&str; 4] = [
    "DWCONV_GROUP_COUNT",
    "DWCONV_CHANNEL_MULTIPLIER",
    "DWCONV_WORKSPACE_LIMIT_BYTES",
    "DWCONV_HAS_BIAS",
];

/// Run `f` with every override cleared except the given ones.
fn with_overrides<R>(set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let vars: Vec<(&str, Option<&str>)> = ENV_KEYS
        .iter()
        .map(|&k| (k, set.iter().find(|(key, _)| *key == k).map(|(_, v)| *v)))
        .collect();
    temp_env::with_vars(vars, f)
}

// ── TOML ─────────────────────────────────────────────────────────────

#[test]
#[serial(dwconv_env)]
fn partial_toml_falls_back_to_defaults() {
    let cfg = with_overrides(&[], || {
        DepthwiseConfig::from_toml(
            r#"
            channels = 32
            num_output = 64
            channel_multiplier = 2
            "#,
        )
    })
    .unwrap();
    assert_eq!(cfg.channels, 32);
    assert_eq!(cfg.num_output, 64);
    assert_eq!(cfg.kernel_height, 3);
    assert_eq!(cfg.workspace_limit_bytes, DEFAULT_WORKSPACE_LIMIT_BYTES);
    assert!(cfg.has_bias);
}

#[test]
#[serial(dwconv_env)]
fn load_reads_file_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let written = DepthwiseConfig::depthwise(16, 1, 5);
    file.write_all(written.to_toml().unwrap().as_bytes()).unwrap();

    let loaded = with_overrides(&[], || DepthwiseConfig::load(file.path())).unwrap();
    assert_eq!(loaded, written);
}

#[test]
#[serial(dwconv_env)]
fn load_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = with_overrides(&[], || DepthwiseConfig::load(&dir.path().join("absent.toml")))
        .unwrap_err();
    assert!(matches!(err, DepthwiseError::Config(_)));
}

#[test]
#[serial(dwconv_env)]
fn malformed_toml_is_config_error() {
    let err = with_overrides(&[], || DepthwiseConfig::from_toml("channels = [")).unwrap_err();
    assert!(matches!(err, DepthwiseError::Config(_)));
}

#[test]
#[serial(dwconv_env)]
fn toml_with_indivisible_groups_fails_validation() {
    let err = with_overrides(&[], || {
        DepthwiseConfig::from_toml("channels = 6\nnum_output = 6\ngroup_count = 4\n")
    })
    .unwrap_err();
    assert!(matches!(err, DepthwiseError::ChannelsNotDivisible { channels: 6, groups: 4 }));
}

// ── Environment overrides ────────────────────────────────────────────

#[test]
#[serial(dwconv_env)]
fn env_overrides_apply_over_defaults() {
    let cfg = with_overrides(
        &[("DWCONV_WORKSPACE_LIMIT_BYTES", "1048576"), ("DWCONV_HAS_BIAS", "off")],
        DepthwiseConfig::from_env,
    )
    .unwrap();
    assert_eq!(cfg.workspace_limit_bytes, 1 << 20);
    assert!(!cfg.has_bias);
}

#[test]
#[serial(dwconv_env)]
fn env_overrides_win_over_toml() {
    let cfg = with_overrides(&[("DWCONV_GROUP_COUNT", "4"), ("DWCONV_CHANNEL_MULTIPLIER", "2")], || {
        DepthwiseConfig::from_toml("channels = 8\nnum_output = 16\ngroup_count = 1\n")
    })
    .unwrap();
    assert_eq!(cfg.group_count, 4);
    assert_eq!(cfg.channel_multiplier, 2);
}

#[test]
#[serial(dwconv_env)]
fn unparseable_env_override_is_rejected() {
    let err = with_overrides(&[("DWCONV_GROUP_COUNT", "many")], DepthwiseConfig::from_env)
        .unwrap_err();
    assert!(err.to_string().contains("DWCONV_GROUP_COUNT"), "{err}");
}

#[test]
#[serial(dwconv_env)]
fn env_override_can_break_validation() {
    let err = with_overrides(&[("DWCONV_GROUP_COUNT", "0")], DepthwiseConfig::from_env).unwrap_err();
    assert!(matches!(err, DepthwiseError::InvalidConfig(_)));
}
