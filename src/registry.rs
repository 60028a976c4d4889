use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{config::ResourceLimits, now_rfc3339, ProvisionError};

pub const REGISTRY_VERSION: u32 = 1;

/// One lifecycle record per user. Records are soft-deleted by setting
/// `deletion_time`; they are never physically removed, so the registry keeps
/// the full audit history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_tag: Option<String>,
    #[serde(flatten)]
    pub limits: ResourceLimits,
    pub creation_time: String,
    pub deletion_time: Option<String>,
}

impl UserRecord {
    pub fn new(
        username: &str,
        email: &str,
        class_tag: Option<&str>,
        limits: ResourceLimits,
    ) -> UserRecord {
        UserRecord {
            username: username.to_owned(),
            email: email.to_owned(),
            class_tag: class_tag.map(|t| t.to_owned()),
            limits,
            creation_time: now_rfc3339(),
            deletion_time: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub class_name: String,
    pub class_tag: String,
    pub num_users: u32,
    #[serde(flatten)]
    pub limits: ResourceLimits,
    pub creation_time: String,
}

impl ClassRecord {
    pub fn new(class: &crate::config::ClassConfig) -> ClassRecord {
        ClassRecord {
            class_name: class.class_name.clone(),
            class_tag: class.class_tag.clone(),
            num_users: class.num_users,
            limits: class.limits.clone(),
            creation_time: now_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassRecord>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        RegistryDocument {
            version: REGISTRY_VERSION,
            classes: BTreeMap::new(),
            users: Vec::new(),
        }
    }
}

/// Storage contract for the user ledger, kept separate from orchestration so
/// a different backend can be swapped in without touching the flows.
///
/// Hard precondition: one writer at a time. Mutations are whole-document
/// read-modify-write; concurrent writers race and the last write wins.
pub trait LedgerStore {
    fn record_class(&mut self, class: ClassRecord) -> Result<(), ProvisionError>;
    fn record_user(&mut self, user: UserRecord) -> Result<(), ProvisionError>;
    /// Unknown or already-deleted usernames are a silent no-op; an existing
    /// deletion timestamp is never overwritten.
    fn mark_user_deleted(&mut self, username: &str) -> Result<(), ProvisionError>;
    fn get_active_user(&self, username: &str) -> Result<Option<UserRecord>, ProvisionError>;
    fn active_users_by_class(&self, class_tag: &str) -> Result<Vec<String>, ProvisionError>;
    fn get_class(&self, class_tag: &str) -> Result<Option<ClassRecord>, ProvisionError>;
}

/// JSON-file backed ledger. Writes go to a temp file in the same directory
/// and are renamed over the target, so readers never observe a torn document.
/// A missing or unparsable file reads as an empty registry.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> FileRegistry {
        FileRegistry { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> RegistryDocument {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => RegistryDocument::default(),
        }
    }

    fn persist(&self, document: &RegistryDocument) -> Result<(), ProvisionError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(|e| {
            ProvisionError::Registry(format!("unable to serialize registry: {}", e))
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ProvisionError::Registry(format!(
                        "unable to create registry directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(|e| {
            ProvisionError::Registry(format!("unable to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            ProvisionError::Registry(format!(
                "unable to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl LedgerStore for FileRegistry {
    fn record_class(&mut self, class: ClassRecord) -> Result<(), ProvisionError> {
        let mut document = self.load();
        document.classes.insert(class.class_tag.clone(), class);
        self.persist(&document)
    }

    fn record_user(&mut self, user: UserRecord) -> Result<(), ProvisionError> {
        let mut document = self.load();
        document.users.push(user);
        self.persist(&document)
    }

    fn mark_user_deleted(&mut self, username: &str) -> Result<(), ProvisionError> {
        let mut document = self.load();
        match document
            .users
            .iter_mut()
            .find(|u| u.username == username && u.deletion_time.is_none())
        {
            Some(user) => {
                user.deletion_time = Some(now_rfc3339());
                self.persist(&document)
            }
            None => Ok(()),
        }
    }

    fn get_active_user(&self, username: &str) -> Result<Option<UserRecord>, ProvisionError> {
        Ok(self
            .load()
            .users
            .into_iter()
            .find(|u| u.username == username && u.deletion_time.is_none()))
    }

    fn active_users_by_class(&self, class_tag: &str) -> Result<Vec<String>, ProvisionError> {
        Ok(self
            .load()
            .users
            .into_iter()
            .filter(|u| u.class_tag.as_deref() == Some(class_tag) && u.deletion_time.is_none())
            .map(|u| u.username)
            .collect())
    }

    fn get_class(&self, class_tag: &str) -> Result<Option<ClassRecord>, ProvisionError> {
        Ok(self.load().classes.get(class_tag).cloned())
    }
}
