pub mod import;
pub mod loader;
pub mod merge;
pub mod schema;
pub mod validate;
pub mod watcher;

pub use loader::{
    CONFIG_FILE, Deprecation, ensure_api_key, get_config_path, load_config,
    load_config_with_warnings, save_config,
};
pub use merge::{ConfigDiff, FieldChange, check_reserved_oauth_params, merge_config, merge_server_spec};
pub use schema::{
    Config, EnvPolicyConfig, IsolationSpec, OauthSpec, Protocol, RESERVED_OAUTH_PARAMS,
    ServerSpec, TlsConfig, TokenizerConfig,
};
pub use validate::{ValidationIssue, validate_server};
