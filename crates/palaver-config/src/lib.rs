//! Palaver Configuration
//!
//! TOML configuration loading and validation

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MAX_PACING_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub messenger: Option<MessengerConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub bot: BotConfig,
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    pub page_access_token: String,
    #[serde(default = "default_messenger_api_base")]
    pub api_base: String,
    #[serde(default = "default_messenger_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub provider_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_reply_chars")]
    pub min_reply_chars: usize,
    pub retry: Option<RetryPolicyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            min_reply_chars: default_min_reply_chars(),
            retry: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub window_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,
    #[serde(default = "default_alternate_offset_ms")]
    pub alternate_offset_ms: u64,
    #[serde(default = "default_follow_up_quiet_ms")]
    pub follow_up_quiet_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            typing_delay_ms: default_typing_delay_ms(),
            alternate_offset_ms: default_alternate_offset_ms(),
            follow_up_quiet_ms: default_follow_up_quiet_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotConfig {
    pub help_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub allowlist: Option<Vec<String>>,
    pub denylist: Option<Vec<String>>,
}

fn default_messenger_api_base() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_messenger_api_version() -> String {
    "v19.0".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_min_reply_chars() -> usize {
    3
}

fn default_typing_delay_ms() -> u64 {
    1200
}

fn default_alternate_offset_ms() -> u64 {
    800
}

fn default_follow_up_quiet_ms() -> u64 {
    6000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("palaver").join("config.toml"))
    }

    /// Resolved data directory; `~` expands to the home directory.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some("~") => dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Home directory not found")),
            Some(dir) if dir.starts_with("~/") => {
                let home = dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Home directory not found"))?;
                Ok(home.join(dir.trim_start_matches("~/")))
            }
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => dirs::data_dir()
                .map(|dir| dir.join("palaver"))
                .ok_or_else(|| anyhow::anyhow!("Data directory not found")),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }
            if !provider_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate provider name '{}'", name);
            }
            if let Some(base_url) = provider.base_url.as_deref() {
                if url::Url::parse(base_url.trim()).is_err() {
                    anyhow::bail!("Provider '{}' has invalid base_url '{}'", name, base_url);
                }
            }
            if let Some(provider_type) = provider.provider_type.as_deref() {
                let provider_type = provider_type.trim().to_lowercase();
                if provider_type != "openai" && provider_type != "anthropic" {
                    anyhow::bail!(
                        "Provider '{}' has unsupported provider_type '{}' (supported: openai, anthropic)",
                        name,
                        provider_type
                    );
                }
            }
        }

        if !self.providers.default_provider.is_empty()
            && !provider_names.contains(&self.providers.default_provider)
        {
            anyhow::bail!(
                "default_provider '{}' is not defined in providers.providers",
                self.providers.default_provider
            );
        }

        if let Some(messenger) = &self.messenger {
            if messenger.page_access_token.trim().is_empty() {
                anyhow::bail!("messenger.page_access_token cannot be empty");
            }
            if url::Url::parse(messenger.api_base.trim()).is_err() {
                anyhow::bail!("messenger.api_base '{}' is not a valid url", messenger.api_base);
            }
            if messenger.api_version.trim().is_empty() {
                anyhow::bail!("messenger.api_version cannot be empty");
            }
        }

        if self.gateway.max_tokens == 0 {
            anyhow::bail!("gateway.max_tokens must be > 0");
        }
        if self.gateway.timeout_secs == 0 {
            anyhow::bail!("gateway.timeout_secs must be > 0");
        }
        if self.gateway.min_reply_chars == 0 {
            anyhow::bail!("gateway.min_reply_chars must be > 0");
        }

        if let Some(retry) = &self.gateway.retry {
            if retry.window_secs == Some(0) {
                anyhow::bail!("gateway.retry.window_secs must be > 0");
            }
            if retry.initial_delay_secs == Some(0) {
                anyhow::bail!("gateway.retry.initial_delay_secs must be > 0");
            }
            if let Some(factor) = retry.backoff_factor {
                if factor < 1 {
                    anyhow::bail!("gateway.retry.backoff_factor must be >= 1");
                }
            }
            if retry.max_delay_secs == Some(0) {
                anyhow::bail!("gateway.retry.max_delay_secs must be > 0");
            }
        }

        for (key, value) in [
            ("typing_delay_ms", self.pacing.typing_delay_ms),
            ("alternate_offset_ms", self.pacing.alternate_offset_ms),
            ("follow_up_quiet_ms", self.pacing.follow_up_quiet_ms),
        ] {
            if value > MAX_PACING_MS {
                anyhow::bail!("pacing.{} must be <= {}", key, MAX_PACING_MS);
            }
        }

        if let Some(help_url) = self.bot.help_url.as_deref() {
            if url::Url::parse(help_url.trim()).is_err() {
                anyhow::bail!("bot.help_url '{}' is not a valid url", help_url);
            }
        }

        if let Some(policy) = &self.policy {
            for item in policy.allowlist.iter().flatten() {
                if item.trim().is_empty() {
                    anyhow::bail!("policy.allowlist contains an empty sender id");
                }
            }
            for item in policy.denylist.iter().flatten() {
                if item.trim().is_empty() {
                    anyhow::bail!("policy.denylist contains an empty sender id");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn validate_accepts_minimal_config_with_defaults() {
        let cfg = parse_config(
            r#"
[core]

[providers]
default_provider = "openai"

[[providers.providers]]
name = "openai"
api_key = "k"
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.gateway.max_tokens, 500);
        assert_eq!(cfg.gateway.min_reply_chars, 3);
        assert_eq!(cfg.pacing.typing_delay_ms, 1200);
        assert_eq!(cfg.pacing.alternate_offset_ms, 800);
        assert!(cfg.messenger.is_none());
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let cfg = parse_config(
            r#"
[providers]
default_provider = "missing"

[[providers.providers]]
name = "openai"
api_key = "k"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_provider_names() {
        let cfg = parse_config(
            r#"
[[providers.providers]]
name = "a"
api_key = "k"

[[providers.providers]]
name = "a"
api_key = "k2"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsupported_provider_type() {
        let cfg = parse_config(
            r#"
[[providers.providers]]
name = "a"
api_key = "k"
provider_type = "carrier-pigeon"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn messenger_section_gets_api_defaults() {
        let cfg = parse_config(
            r#"
[messenger]
page_access_token = "EAAB"
"#,
        );
        assert!(cfg.validate().is_ok());
        let messenger = cfg.messenger.expect("messenger");
        assert_eq!(messenger.api_base, "https://graph.facebook.com");
        assert_eq!(messenger.api_version, "v19.0");
    }

    #[test]
    fn validate_rejects_empty_page_token() {
        let cfg = parse_config(
            r#"
[messenger]
page_access_token = "  "
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_gateway_limits() {
        let cfg = parse_config(
            r#"
[gateway]
timeout_secs = 0
"#,
        );
        assert!(cfg.validate().is_err());

        let cfg = parse_config(
            r#"
[gateway]
min_reply_chars = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_excessive_pacing() {
        let cfg = parse_config(
            r#"
[pacing]
follow_up_quiet_ms = 600000
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_help_url_and_empty_policy_entries() {
        let cfg = parse_config(
            r#"
[bot]
help_url = "not a url"
"#,
        );
        assert!(cfg.validate().is_err());

        let cfg = parse_config(
            r#"
[policy]
denylist = ["123", ""]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn data_dir_uses_configured_path() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/var/lib/palaver"
"#,
        );
        assert_eq!(
            cfg.data_dir().expect("data dir"),
            std::path::PathBuf::from("/var/lib/palaver")
        );
    }
}
