use hiro_system_kit::slog;
use std::{fs, path::Path};

use crate::{
    app_config::AppConfig,
    config::{ClassConfig, UserConfig},
    dex::{self, NewCredential},
    registry::{ClassRecord, LedgerStore, UserRecord},
    template_parser::{load_template, manifest_output_path, render_manifest},
    Context, ProvisionError, TenantK8sManager,
};

/// Per-batch result. One user's failure never aborts the batch, so callers
/// get an explicit tally instead of having to infer it from logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sequences rendering, cluster calls, ledger bookkeeping and the dex update
/// for the create and delete flows. Strictly sequential: one cluster call in
/// flight at a time, one user after another.
pub struct LifecycleOrchestrator<S: LedgerStore> {
    manager: TenantK8sManager,
    registry: S,
    settings: AppConfig,
    ctx: Context,
}

impl<S: LedgerStore> LifecycleOrchestrator<S> {
    pub fn new(
        manager: TenantK8sManager,
        registry: S,
        settings: AppConfig,
        ctx: Context,
    ) -> LifecycleOrchestrator<S> {
        LifecycleOrchestrator {
            manager,
            registry,
            settings,
            ctx,
        }
    }

    /// Single-user create flow. The dex update runs only if the user was
    /// actually provisioned; a dex failure after that point leaves the cluster
    /// resources and ledger record in place (at-least-once, no rollback).
    pub async fn create_user(&mut self, user: UserConfig) -> Result<BatchOutcome, ProvisionError> {
        let mut outcome = BatchOutcome::default();
        match self.provision_one(&user, None, false).await {
            Ok(()) => outcome.succeeded.push(user.username.clone()),
            Err(e) => {
                self.ctx.try_log(|logger| {
                    slog::error!(logger, "failed to create user {}: {}", user.username, e)
                });
                outcome.failed.push(user.username.clone());
                return Ok(outcome);
            }
        }
        self.update_broker(vec![user.credential()]).await?;
        Ok(outcome)
    }

    /// Bulk create flow: the class is recorded once, before any user; then
    /// each derived user is provisioned independently, and one dex update
    /// covers everyone who made it.
    pub async fn create_class(
        &mut self,
        class: ClassConfig,
    ) -> Result<BatchOutcome, ProvisionError> {
        self.registry.record_class(ClassRecord::new(&class))?;

        let users = class.derive_users(&self.settings.tenant.email_domain);
        let mut outcome = BatchOutcome::default();
        let mut credentials: Vec<NewCredential> = Vec::new();
        for user in &users {
            match self.provision_one(user, Some(&class.class_tag), true).await {
                Ok(()) => {
                    // the operator hands this password out; there is no other copy
                    self.ctx.try_log(|logger| {
                        slog::info!(
                            logger,
                            "user {} created successfully with password: {}",
                            user.username,
                            user.password
                        )
                    });
                    outcome.succeeded.push(user.username.clone());
                    credentials.push(user.credential());
                }
                Err(e) => {
                    self.ctx.try_log(|logger| {
                        slog::error!(logger, "failed to create user {}: {}", user.username, e)
                    });
                    outcome.failed.push(user.username.clone());
                }
            }
        }

        if !credentials.is_empty() {
            self.update_broker(credentials).await?;
        }

        self.ctx.try_log(|logger| {
            slog::info!(
                logger,
                "bulk creation for class {} finished: {} created, {} failed",
                class.class_name,
                outcome.succeeded.len(),
                outcome.failed.len()
            )
        });
        Ok(outcome)
    }

    /// Deletes each user independently; a failed user is skipped, not fatal.
    pub async fn delete_users(&mut self, usernames: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for username in usernames {
            match self.delete_one(username).await {
                Ok(()) => {
                    self.ctx.try_log(|logger| {
                        slog::info!(
                            logger,
                            "successfully deleted user {} and associated resources",
                            username
                        )
                    });
                    outcome.succeeded.push(username.clone());
                }
                Err(e) => {
                    self.ctx.try_log(|logger| {
                        slog::error!(logger, "failed to delete user {}: {}", username, e)
                    });
                    outcome.failed.push(username.clone());
                }
            }
        }
        outcome
    }

    /// Resolves a class tag to its active users and asks `confirm` before
    /// touching anything. A non-affirmative answer means zero cluster calls
    /// and an unchanged ledger.
    pub async fn delete_class_users<F>(
        &mut self,
        class_tag: &str,
        confirm: F,
    ) -> Result<BatchOutcome, ProvisionError>
    where
        F: FnOnce(&[String]) -> bool,
    {
        let usernames = self.registry.active_users_by_class(class_tag)?;
        if usernames.is_empty() {
            self.ctx.try_log(|logger| {
                slog::warn!(logger, "no active users found for class {}", class_tag)
            });
            return Ok(BatchOutcome::default());
        }
        if !confirm(&usernames) {
            self.ctx
                .try_log(|logger| slog::info!(logger, "deletion cancelled"));
            return Ok(BatchOutcome::default());
        }
        Ok(self.delete_users(&usernames).await)
    }

    /// Render, persist the manifest, apply, then record. The ledger record is
    /// written only once the cluster apply has succeeded; any earlier failure
    /// leaves no trace of the user.
    async fn provision_one(
        &mut self,
        user: &UserConfig,
        class_tag: Option<&str>,
        per_user_manifest: bool,
    ) -> Result<(), ProvisionError> {
        let template = load_template(Path::new(&self.settings.paths.template_path))?;
        let rendered = render_manifest(&template, &user.template_params())?;

        let manifests_dir = Path::new(&self.settings.paths.manifests_dir);
        fs::create_dir_all(manifests_dir).map_err(|e| {
            ProvisionError::Input(format!(
                "unable to create manifests directory {}: {}",
                manifests_dir.display(),
                e
            ))
        })?;
        let out_path = manifest_output_path(
            manifests_dir,
            per_user_manifest.then_some(user.username.as_str()),
        );
        fs::write(&out_path, &rendered).map_err(|e| {
            ProvisionError::Input(format!("unable to write {}: {}", out_path.display(), e))
        })?;
        self.ctx.try_log(|logger| {
            slog::info!(logger, "manifest written to {}", out_path.display())
        });

        self.manager.apply_profile(&rendered).await?;

        self.registry.record_user(UserRecord::new(
            &user.username,
            &user.user_email,
            class_tag,
            user.limits.clone(),
        ))
    }

    /// One fetch/decode/append/apply/restart cycle for the whole batch.
    async fn update_broker(&self, credentials: Vec<NewCredential>) -> Result<(), ProvisionError> {
        let mut configmap = self.manager.get_dex_config().await?;
        dex::append_credentials(&mut configmap, &credentials)?;

        // audit copy of the exact document we are about to apply
        let manifests_dir = Path::new(&self.settings.paths.manifests_dir);
        fs::create_dir_all(manifests_dir).map_err(|e| {
            ProvisionError::Input(format!(
                "unable to create manifests directory {}: {}",
                manifests_dir.display(),
                e
            ))
        })?;
        let audit = serde_yaml::to_string(&configmap).map_err(|e| {
            ProvisionError::ConfigStructure(format!("unable to encode dex configmap: {}", e))
        })?;
        let audit_path = manifests_dir.join("updated-dex-config.yaml");
        fs::write(&audit_path, audit).map_err(|e| {
            ProvisionError::Input(format!("unable to write {}: {}", audit_path.display(), e))
        })?;

        self.manager.apply_dex_config(&configmap).await?;
        self.manager.restart_dex().await
    }

    /// Normal delete, escalating once to the forced variant. The namespace is
    /// only touched after the profile is gone, and the ledger only after both.
    async fn delete_one(&mut self, username: &str) -> Result<(), ProvisionError> {
        if let Err(e) = self.manager.delete_profile(username).await {
            self.ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "failed to delete profile for user {}, attempting force delete: {}",
                    username,
                    e
                )
            });
            self.manager.force_delete_profile(username).await?;
        }

        if let Err(e) = self.manager.delete_namespace(username).await {
            self.ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "failed to delete namespace for user {}, attempting force delete: {}",
                    username,
                    e
                )
            });
            self.manager.force_delete_namespace(username).await?;
        }

        self.registry.mark_user_deleted(username)
    }
}
