use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use uuid::Uuid;

use crate::ProvisionError;

pub const DEX_NAMESPACE: &str = "auth";
pub const DEX_CONFIGMAP: &str = "dex";
pub const DEX_DEPLOYMENT: &str = "dex";

const EMBEDDED_CONFIG_KEY: &str = "config.yaml";
const STATIC_PASSWORDS_KEY: &str = "staticPasswords";
const USER_ID_LEN: usize = 5;

/// One entry in dex's `staticPasswords` list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StaticPassword {
    pub email: String,
    pub hash: String,
    pub username: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// Plaintext credential for a newly provisioned user, hashed on its way into
/// the dex document and never stored anywhere else.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// Appends one static password entry per user to the dex configmap's embedded
/// config document. All entries are computed up front, so a failure anywhere
/// leaves the document untouched; partial credential lists are never produced.
pub fn append_credentials(
    configmap: &mut ConfigMap,
    users: &[NewCredential],
) -> Result<(), ProvisionError> {
    let data = configmap.data.as_mut().ok_or_else(|| {
        ProvisionError::ConfigStructure("dex configmap has no data section".into())
    })?;
    let embedded = data.get(EMBEDDED_CONFIG_KEY).ok_or_else(|| {
        ProvisionError::ConfigStructure(format!(
            "dex configmap data has no '{}' key",
            EMBEDDED_CONFIG_KEY
        ))
    })?;
    let mut inner: Value = serde_yaml::from_str(embedded).map_err(|e| {
        ProvisionError::ConfigStructure(format!("unable to parse embedded dex config: {}", e))
    })?;

    let mut new_entries = Vec::with_capacity(users.len());
    for user in users {
        let hash = bcrypt::hash(&user.password, bcrypt::DEFAULT_COST).map_err(|e| {
            ProvisionError::Credential(format!(
                "failed to hash password for {}: {}",
                user.username, e
            ))
        })?;
        let entry = StaticPassword {
            email: user.email.clone(),
            hash,
            username: user.username.clone(),
            user_id: generate_user_id(),
        };
        let entry = serde_yaml::to_value(&entry).map_err(|e| {
            ProvisionError::ConfigStructure(format!("unable to encode dex entry: {}", e))
        })?;
        new_entries.push(entry);
    }

    let mapping = inner.as_mapping_mut().ok_or_else(|| {
        ProvisionError::ConfigStructure("embedded dex config is not a mapping".into())
    })?;
    let key = Value::String(STATIC_PASSWORDS_KEY.into());
    if mapping.get(&key).is_none() {
        mapping.insert(key.clone(), Value::Sequence(vec![]));
    }
    let entries = mapping
        .get_mut(&key)
        .and_then(|v| v.as_sequence_mut())
        .ok_or_else(|| {
            ProvisionError::ConfigStructure(format!(
                "'{}' in the embedded dex config is not a list",
                STATIC_PASSWORDS_KEY
            ))
        })?;
    entries.extend(new_entries);

    let inner_str = serde_yaml::to_string(&inner).map_err(|e| {
        ProvisionError::ConfigStructure(format!("unable to encode embedded dex config: {}", e))
    })?;
    data.insert(EMBEDDED_CONFIG_KEY.to_string(), inner_str);
    Ok(())
}

// Short identifier unique enough to avoid dex-side collisions; deliberately
// not derived from the username.
fn generate_user_id() -> String {
    Uuid::new_v4().to_string().chars().take(USER_ID_LEN).collect()
}
