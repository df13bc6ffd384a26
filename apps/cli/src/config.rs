use std::{collections::HashMap, fs, path::Path, time::Duration};

use delivery::EngineConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base_url: String,
    pub user_agent: Option<String>,
    pub client_key: Option<String>,
    pub recruitment_rate_secs: u64,
    pub standard_rate_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "https://www.nationstates.net".into(),
            user_agent: None,
            client_key: None,
            recruitment_rate_secs: 180,
            standard_rate_secs: 30,
            refresh_interval_secs: 60,
        }
    }
}

impl Settings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            recruitment_rate: Duration::from_secs(self.recruitment_rate_secs),
            standard_rate: Duration::from_secs(self.standard_rate_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
        }
    }
}

pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url").and_then(toml::Value::as_str) {
                settings.api_base_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("user_agent").and_then(toml::Value::as_str) {
                settings.user_agent = Some(v.to_string());
            }
            if let Some(v) = file_cfg.get("client_key").and_then(toml::Value::as_str) {
                settings.client_key = Some(v.to_string());
            }
            if let Some(v) = file_cfg
                .get("recruitment_rate_secs")
                .and_then(toml::Value::as_integer)
            {
                settings.recruitment_rate_secs = v as u64;
            }
            if let Some(v) = file_cfg
                .get("standard_rate_secs")
                .and_then(toml::Value::as_integer)
            {
                settings.standard_rate_secs = v as u64;
            }
            if let Some(v) = file_cfg
                .get("refresh_interval_secs")
                .and_then(toml::Value::as_integer)
            {
                settings.refresh_interval_secs = v as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("TGCAST__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("TGCAST__USER_AGENT") {
        settings.user_agent = Some(v);
    }
    if let Ok(v) = std::env::var("TGCAST__CLIENT_KEY") {
        settings.client_key = Some(v);
    }
    if let Ok(v) = std::env::var("TGCAST__RECRUITMENT_RATE_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.recruitment_rate_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("TGCAST__STANDARD_RATE_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.standard_rate_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("TGCAST__REFRESH_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.refresh_interval_secs = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/tgcast.toml"));
        assert_eq!(settings.api_base_url, "https://www.nationstates.net");
        assert_eq!(settings.recruitment_rate_secs, 180);
        assert_eq!(settings.standard_rate_secs, 30);
        assert_eq!(settings.refresh_interval_secs, 60);
        assert!(settings.user_agent.is_none());
        assert!(settings.client_key.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("tgcast_config_test_{suffix}.toml"));
        fs::write(
            &path,
            "api_base_url = \"http://127.0.0.1:9099\"\nstandard_rate_secs = 5\nuser_agent = \"tester\"\n",
        )
        .expect("write config");

        let settings = load_settings(&path);
        assert_eq!(settings.api_base_url, "http://127.0.0.1:9099");
        assert_eq!(settings.standard_rate_secs, 5);
        assert_eq!(settings.user_agent.as_deref(), Some("tester"));
        assert_eq!(settings.recruitment_rate_secs, 180);

        fs::remove_file(path).expect("cleanup");
    }
}
