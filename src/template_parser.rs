use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::ProvisionError;

/// Reads the profile template from disk. A missing or empty template aborts
/// the current user's creation before any cluster call is made.
pub fn load_template(path: &Path) -> Result<String, ProvisionError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ProvisionError::Input(format!("template {} not found: {}", path.display(), e))
    })?;
    if content.trim().is_empty() {
        return Err(ProvisionError::Input(format!(
            "template {} is empty",
            path.display()
        )));
    }
    Ok(content)
}

/// Substitutes every `{{ var }}` placeholder. Placeholders left unresolved
/// after substitution mean the template and the parameter set disagree, which
/// is an error rather than a silently broken manifest.
pub fn render_manifest(
    template: &str,
    params: &[(&'static str, String)],
) -> Result<String, ProvisionError> {
    let mut rendered = template.to_string();
    for (key, value) in params {
        rendered = rendered.replace(&format!("{{{{ {} }}}}", key), value);
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    if let Some(start) = rendered.find("{{") {
        let leftover: String = rendered[start..].chars().take(40).collect();
        return Err(ProvisionError::Input(format!(
            "unresolved template variable near '{}'",
            leftover.trim()
        )));
    }
    Ok(rendered)
}

/// Bulk mode writes one manifest per user; single-user mode reuses a shared
/// file name.
pub fn manifest_output_path(manifests_dir: &Path, username: Option<&str>) -> PathBuf {
    match username {
        Some(username) => manifests_dir.join(format!("create-user-{}.yaml", username)),
        None => manifests_dir.join("create-user.yaml"),
    }
}
