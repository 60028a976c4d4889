use std::{
    fs::File,
    io::{BufReader, Read},
};

use serde::{Deserialize, Serialize};

use crate::Deadlines;

/// Tool settings loaded from a TOML file. Every section and field has a
/// default, so running without a settings file works out of the box.
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default, rename = "paths")]
    pub paths: PathConfig,
    #[serde(default, rename = "tenant")]
    pub tenant: TenantConfig,
    #[serde(default, rename = "deadlines")]
    pub deadlines: DeadlineConfig,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PathConfig {
    pub template_path: String,
    pub manifests_dir: String,
    pub registry_path: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            template_path: "templates/create-user-template.yaml".into(),
            manifests_dir: "manifests".into(),
            registry_path: "users/user_registry.json".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TenantConfig {
    /// Domain appended to derived usernames when bulk mode generates emails.
    pub email_domain: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        TenantConfig {
            email_domain: "paf-iast".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeadlineConfig {
    pub apply_secs: u64,
    pub delete_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        let deadlines = Deadlines::default();
        DeadlineConfig {
            apply_secs: deadlines.apply_secs,
            delete_secs: deadlines.delete_secs,
        }
    }
}

impl DeadlineConfig {
    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            apply_secs: self.apply_secs,
            delete_secs: self.delete_secs,
        }
    }
}

impl AppConfig {
    pub fn from_path(config_path: &str) -> AppConfig {
        let file = File::open(config_path)
            .unwrap_or_else(|e| panic!("unable to read file {}\n{:?}", config_path, e));
        let mut file_reader = BufReader::new(file);
        let mut file_buffer = vec![];
        file_reader
            .read_to_end(&mut file_buffer)
            .unwrap_or_else(|e| panic!("unable to read file {}\n{:?}", config_path, e));

        let config_file: AppConfig = match toml::from_slice(&file_buffer) {
            Ok(s) => s,
            Err(e) => {
                panic!("Config file malformatted {}", e.to_string());
            }
        };
        config_file
    }
}
