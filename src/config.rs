use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dex::NewCredential;

const PASSWORD_LEN: usize = 5;
const PASSWORD_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Resource entitlements for one tenant, stored as the values in effect at
/// creation time. They are never re-validated against live cluster state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub gpu_mem: String,
    pub gpu_count: String,
    pub storage_limit: String,
}

impl ResourceLimits {
    /// Memory and storage values entered without a unit get a `Gi` suffix,
    /// matching what the resource quota expects.
    pub fn normalized(mut self) -> Self {
        if !self.memory_limit.ends_with("Gi") {
            self.memory_limit = format!("{}Gi", self.memory_limit);
        }
        if !self.storage_limit.ends_with("Gi") {
            self.storage_limit = format!("{}Gi", self.storage_limit);
        }
        self
    }
}

/// Parameters for provisioning one user.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub profile_name: String,
    pub user_email: String,
    pub username: String,
    pub password: String,
    pub limits: ResourceLimits,
}

impl UserConfig {
    pub fn template_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("profile_name", self.profile_name.clone()),
            ("user_email", self.user_email.clone()),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
            ("cpu_limit", self.limits.cpu_limit.clone()),
            ("memory_limit", self.limits.memory_limit.clone()),
            ("gpu_mem", self.limits.gpu_mem.clone()),
            ("gpu_count", self.limits.gpu_count.clone()),
            ("storage_limit", self.limits.storage_limit.clone()),
        ]
    }

    pub fn credential(&self) -> NewCredential {
        NewCredential {
            email: self.user_email.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Descriptor for a bulk-created cohort sharing one set of limits.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    pub class_name: String,
    pub class_tag: String,
    pub num_users: u32,
    pub limits: ResourceLimits,
}

impl ClassConfig {
    /// Derives the cohort's users deterministically as `{tag}-{1..count}`,
    /// each with a fresh generated password.
    pub fn derive_users(&self, email_domain: &str) -> Vec<UserConfig> {
        (1..=self.num_users)
            .map(|i| {
                let username = format!("{}-{}", self.class_tag, i);
                UserConfig {
                    profile_name: username.clone(),
                    user_email: format!("{}@{}", username, email_domain),
                    username,
                    password: generate_password(),
                    limits: self.limits.clone(),
                }
            })
            .collect()
    }
}

pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}
