use std::path::PathBuf;

use clap::Parser;
use url::Url;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::handshake::LaunchParams;

#[derive(Parser)]
#[command(name = "lms-chat")]
#[command(version)]
#[command(about = "Terminal client for an LMS-embedded assistant chat backend")]
pub struct Args {
    /// One-shot prompt; omit to start an interactive session
    pub prompt: Option<String>,

    /// Backend API base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Course external id sent when opening a conversation
    #[arg(long)]
    pub course: Option<String>,

    /// Fallback user id for the x-dev-user header
    #[arg(long)]
    pub user: Option<String>,

    /// Embedding session token, as passed by the host on launch
    #[arg(long)]
    pub token: Option<String>,

    /// Full launch URL; token, origin, course and page are taken from it
    #[arg(long)]
    pub launch_url: Option<String>,

    /// Development mode: skip the handshake with a synthetic identity
    #[arg(long)]
    pub dev: bool,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path of the durable state file (identity, deleted chats)
    #[arg(long)]
    pub state_file: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub plain: bool,
}

/// Fold command-line flags over an already layered configuration. Flags win
/// over both the config file and the environment.
pub fn apply_args(config: &mut ChatConfig, args: &Args) {
    if let Some(base_url) = &args.base_url {
        config.api_base_url = base_url.trim_end_matches('/').to_string();
    }
    if let Some(course) = &args.course {
        config.course_external_id = course.clone();
    }
    if let Some(user) = &args.user {
        config.default_user = user.clone();
    }
    if let Some(state_file) = &args.state_file {
        config.state_file = state_file.clone();
    }
    if args.dev {
        config.dev_mode = true;
    }
}

/// Build the launch parameters the handshake runs on. A full launch URL
/// takes precedence; otherwise a bare token (with the host defaults) is
/// enough.
pub fn launch_params(args: &Args, config: &ChatConfig) -> Result<LaunchParams, ChatError> {
    if let Some(raw) = &args.launch_url {
        let url = Url::parse(raw)?;
        return Ok(LaunchParams::from_url(&url));
    }
    let mut params = LaunchParams::default();
    params.token = args.token.clone();
    params.course_id = Some(config.course_external_id.clone());
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> Args {
        Args::parse_from(["lms-chat"])
    }

    #[test]
    fn test_apply_args_overrides_config() {
        let mut config = ChatConfig::default();
        let mut args = bare_args();
        args.base_url = Some("https://backend.example/api/".to_string());
        args.course = Some("c42".to_string());
        args.dev = true;
        apply_args(&mut config, &args);
        assert_eq!(config.api_base_url, "https://backend.example/api");
        assert_eq!(config.course_external_id, "c42");
        assert!(config.dev_mode);
    }

    #[test]
    fn test_apply_args_keeps_defaults_when_unset() {
        let mut config = ChatConfig::default();
        let before = config.api_base_url.clone();
        apply_args(&mut config, &bare_args());
        assert_eq!(config.api_base_url, before);
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_launch_params_from_url_flag() {
        let mut args = bare_args();
        args.launch_url =
            Some("https://chat.example/?moodle_token=t1&course_id=c9".to_string());
        args.token = Some("ignored".to_string());
        let params = launch_params(&args, &ChatConfig::default()).expect("params");
        assert_eq!(params.token.as_deref(), Some("t1"));
        assert_eq!(params.course_id.as_deref(), Some("c9"));
    }

    #[test]
    fn test_launch_params_from_bare_token() {
        let mut args = bare_args();
        args.token = Some("t2".to_string());
        let params = launch_params(&args, &ChatConfig::default()).expect("params");
        assert_eq!(params.token.as_deref(), Some("t2"));
        assert!(params.from_host());
    }

    #[test]
    fn test_launch_params_invalid_url_rejected() {
        let mut args = bare_args();
        args.launch_url = Some("not a url".to_string());
        assert!(launch_params(&args, &ChatConfig::default()).is_err());
    }
}
