//! Runtime settings.
//!
//! Read from an optional TOML file, then overridden by `SPLIT_*`
//! environment variables (`SPLIT_BASE_URL`, `SPLIT_EMAIL_LIMIT_REMINDER`,
//! ...). Every key has a default so an empty environment is valid.

use crate::core::notification::NotificationKind;
use crate::notify::RateLimitPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

pub const DEFAULT_CONFIG_PATH: &str = "settlement-engine";
pub const ENV_PREFIX: &str = "SPLIT";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_currency: String,
    pub base_url: String,
    pub activity_log_limit: usize,
    pub scheduler_settlement_time: String,
    pub scheduler_reminder_time: String,
    pub email_rate_limiting_enabled: bool,
    pub email_limit_reminder: usize,
    pub email_limit_settlement: usize,
    pub email_limit_invitation: usize,
    pub email_limit_precreated_invitation: usize,
    pub email_limit_group_created: usize,
    pub email_limit_total_daily: usize,
    pub rates_api_url: String,
    pub rate_cache_seconds: i64,
    pub data_file: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            base_url: "http://localhost:5000".to_string(),
            activity_log_limit: 100,
            scheduler_settlement_time: "23:30".to_string(),
            scheduler_reminder_time: "09:00".to_string(),
            email_rate_limiting_enabled: true,
            email_limit_reminder: 1,
            email_limit_settlement: 5,
            email_limit_invitation: 25,
            email_limit_precreated_invitation: 25,
            email_limit_group_created: 19,
            email_limit_total_daily: 50,
            rates_api_url: "https://open.er-api.com/v6".to_string(),
            rate_cache_seconds: 3600,
            data_file: None,
        }
    }
}

impl Settings {
    /// Load settings from `path` (extension optional, file optional) and
    /// the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or(DEFAULT_CONFIG_PATH);
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        let per_kind = HashMap::from([
            (NotificationKind::Reminder, self.email_limit_reminder),
            (NotificationKind::Settlement, self.email_limit_settlement),
            (NotificationKind::Invitation, self.email_limit_invitation),
            (
                NotificationKind::PrecreatedInvitation,
                self.email_limit_precreated_invitation,
            ),
            (NotificationKind::GroupCreated, self.email_limit_group_created),
        ]);
        RateLimitPolicy {
            enabled: self.email_rate_limiting_enabled,
            per_kind,
            total_daily: self.email_limit_total_daily,
            ..RateLimitPolicy::default()
        }
    }

    pub fn links(&self) -> Links {
        Links::new(&self.base_url)
    }
}

/// Builds the URLs embedded in notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links {
    base_url: String,
}

impl Links {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn group(&self, share_token: &str) -> String {
        format!("{}/join/{}", self.base_url, share_token)
    }

    pub fn participant(&self, share_token: &str, access_token: &str) -> String {
        format!("{}/group/{}?access={}", self.base_url, share_token, access_token)
    }

    pub fn admin(&self, share_token: &str, admin_token: &str) -> String {
        format!("{}/group/{}/admin/{}", self.base_url, share_token, admin_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.scheduler_settlement_time, "23:30");
        assert_eq!(s.scheduler_reminder_time, "09:00");
        let policy = s.rate_limit_policy();
        assert!(policy.enabled);
        assert_eq!(policy.per_kind[&NotificationKind::Reminder], 1);
        assert_eq!(policy.per_kind[&NotificationKind::GroupCreated], 19);
        assert_eq!(policy.total_daily, 50);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let s = Settings::load(path.to_str()).unwrap();
        assert_eq!(s.activity_log_limit, 100);
    }

    #[test]
    fn test_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "base_url = \"https://split.example\"\nemail_limit_settlement = 2\n").unwrap();
        let s = Settings::load(path.to_str()).unwrap();
        assert_eq!(s.base_url, "https://split.example");
        assert_eq!(s.rate_limit_policy().per_kind[&NotificationKind::Settlement], 2);
    }

    #[test]
    fn test_links() {
        let links = Links::new("https://split.example/");
        assert_eq!(links.group("ABC"), "https://split.example/join/ABC");
        assert_eq!(links.admin("ABC", "XYZ"), "https://split.example/group/ABC/admin/XYZ");
    }
}
