use fog::config::{CloudConfig, GlobalConfig, DEFAULT_BRANCH_PREFIX};

fn minimal_global_toml(fog_home: &str) -> String {
    format!("fog_home = \"{fog_home}\"\n")
}

#[test]
fn global_config_applies_defaults() {
    let config = GlobalConfig::from_toml_str(&minimal_global_toml("/tmp/fog-home")).unwrap();
    assert_eq!(config.default_tool, "claude");
    assert_eq!(config.branch_prefix, DEFAULT_BRANCH_PREFIX);
    assert_eq!(config.bind_addr, "127.0.0.1:4173");
    assert!(!config.autopr_default);
    assert!(config.cloud_base_url.is_none());
}

#[test]
fn global_config_rejects_empty_default_tool() {
    let toml = format!(
        "{}default_tool = \"\"\n",
        minimal_global_toml("/tmp/fog-home")
    );
    let err = GlobalConfig::from_toml_str(&toml).unwrap_err();
    assert!(err.to_string().contains("default_tool"));
}

#[test]
fn global_config_falls_back_to_default_branch_prefix_when_blank() {
    let toml = format!(
        "{}branch_prefix = \"   \"\n",
        minimal_global_toml("/tmp/fog-home")
    );
    let config = GlobalConfig::from_toml_str(&toml).unwrap();
    assert_eq!(config.branch_prefix, DEFAULT_BRANCH_PREFIX);
}

#[test]
fn global_config_derives_paths_under_fog_home() {
    let config = GlobalConfig::from_toml_str(&minimal_global_toml("/tmp/fog-home-paths")).unwrap();
    assert_eq!(config.db_path(), std::path::PathBuf::from("/tmp/fog-home-paths/fog.db"));
    assert_eq!(
        config.master_key_path(),
        std::path::PathBuf::from("/tmp/fog-home-paths/master.key")
    );
    assert_eq!(
        config.api_token_path(),
        std::path::PathBuf::from("/tmp/fog-home-paths/api.token")
    );
    assert_eq!(
        config.repos_root(),
        std::path::PathBuf::from("/tmp/fog-home-paths/repos")
    );
}

#[test]
fn global_config_parses_tool_models_and_cloud_url() {
    let toml = format!(
        "{}cloud_base_url = \"https://cloud.fog.example\"\n\n[tool_models]\nclaude = \"opus\"\ncursor = \"fast\"\n",
        minimal_global_toml("/tmp/fog-home")
    );
    let config = GlobalConfig::from_toml_str(&toml).unwrap();
    assert_eq!(config.cloud_base_url.as_deref(), Some("https://cloud.fog.example"));
    assert_eq!(config.tool_models.models.get("claude").map(String::as_str), Some("opus"));
    assert_eq!(config.tool_models.models.get("cursor").map(String::as_str), Some("fast"));
}

fn minimal_cloud_toml(data_dir: &str) -> String {
    format!(
        "cloud_data_dir = \"{data_dir}\"\nslack_signing_secret = \"shh\"\nslack_client_id = \"id\"\nslack_client_secret = \"secret\"\n"
    )
}

#[test]
fn cloud_config_applies_defaults() {
    let config = CloudConfig::from_toml_str(&minimal_cloud_toml("/tmp/fogcloud-home")).unwrap();
    assert_eq!(config.bind_addr, "0.0.0.0:8080");
    assert_eq!(config.pairing_ttl_secs, 600);
}

#[test]
fn cloud_config_rejects_empty_signing_secret() {
    let toml = "cloud_data_dir = \"/tmp/fogcloud-home\"\nslack_signing_secret = \"\"\nslack_client_id = \"id\"\nslack_client_secret = \"secret\"\n";
    let err = CloudConfig::from_toml_str(toml).unwrap_err();
    assert!(err.to_string().contains("slack_signing_secret"));
}

#[test]
fn cloud_config_rejects_zero_pairing_ttl() {
    let toml = format!(
        "{}pairing_ttl_secs = 0\n",
        minimal_cloud_toml("/tmp/fogcloud-home")
    );
    let err = CloudConfig::from_toml_str(&toml).unwrap_err();
    assert!(err.to_string().contains("pairing_ttl_secs"));
}

#[test]
fn cloud_config_db_and_key_paths_are_under_data_dir() {
    let config = CloudConfig::from_toml_str(&minimal_cloud_toml("/tmp/fogcloud-paths")).unwrap();
    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/fogcloud-paths/fogcloud.db")
    );
    assert_eq!(
        config.master_key_path(),
        std::path::PathBuf::from("/tmp/fogcloud-paths/master.key")
    );
}

#[test]
fn global_config_rejects_invalid_toml() {
    let err = GlobalConfig::from_toml_str("not valid toml {{{").unwrap_err();
    assert!(matches!(err, fog::AppError::Config(_)));
}
