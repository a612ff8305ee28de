use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::manifest::{PostAction, ResourceDescriptor, Settings};
use crate::process;
use crate::transport::{Environment, download_path};

/// Outcome of post-processing; kept separate from the fetch result so a
/// finalize failure never rewrites the recorded fetch status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    Done,
    NothingToDo,
    Failed(String),
}

pub fn finalize(
    desc: &ResourceDescriptor,
    settings: &Settings,
    env: &Environment,
) -> FinalizeResult {
    if desc.post_actions.is_empty() {
        return FinalizeResult::NothingToDo;
    }
    for action in &desc.post_actions {
        let step = match action {
            PostAction::ExtractArchive => extract_archive(desc),
            PostAction::RegisterPath => {
                let path_file = settings.install_root.join("path.env");
                register_path_entry(&path_file, &desc.destination.display().to_string())
                    .map(|_| ())
            }
            PostAction::InstallRequirements(rel) => install_requirements(desc, env, rel),
        };
        if let Err(e) = step {
            return FinalizeResult::Failed(e.to_string());
        }
    }
    FinalizeResult::Done
}

fn extract_archive(desc: &ResourceDescriptor) -> Result<()> {
    let archive = download_path(desc);
    if !archive.is_file() {
        return Err(Error::msg(format!(
            "archive missing: {}",
            archive.display()
        )));
    }
    let dest = &desc.destination;
    fs::create_dir_all(dest)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;

    let name = archive
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cmd = if name.ends_with(".zip") {
        let mut c = Command::new("unzip");
        c.arg("-o").arg(&archive).arg("-d").arg(dest);
        c
    } else {
        let mut c = Command::new("tar");
        c.arg("-xf").arg(&archive).arg("-C").arg(dest);
        c
    };
    let out = process::output(&mut cmd)?;
    if !out.success() {
        return Err(Error::msg(format!(
            "extraction failed: {}",
            out.summary()
        )));
    }

    fs::remove_file(&archive)
        .map_err(|e| Error::msg(format!("failed to remove {}: {e}", archive.display())))?;
    flatten_single_dir(dest)
}

/// Archives often wrap their content in one top-level folder; hoist it so
/// later path lookups land on stable locations.
pub fn flatten_single_dir(dest: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dest)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dest.display())))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dest.display())))?;

    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.path().is_dir() {
        return Ok(());
    }

    // Rename aside first: a child may carry the same name as the wrapper.
    let tmp = dest.join(".flatten-tmp");
    fs::rename(only.path(), &tmp)
        .map_err(|e| Error::msg(format!("failed to move {}: {e}", only.path().display())))?;
    for child in fs::read_dir(&tmp)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", tmp.display())))?
    {
        let child = child.map_err(|e| Error::msg(format!("read_dir error: {e}")))?;
        let target = dest.join(child.file_name());
        fs::rename(child.path(), &target).map_err(|e| {
            Error::msg(format!(
                "failed to move {} -> {}: {e}",
                child.path().display(),
                target.display()
            ))
        })?;
    }
    fs::remove_dir(&tmp)
        .map_err(|e| Error::msg(format!("failed to remove {}: {e}", tmp.display())))?;
    Ok(())
}

#[cfg(windows)]
const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: char = ':';

/// Append `entry` to the persisted PATH value unless the value already
/// contains it. Returns whether an append happened; repeat runs keep exactly
/// one occurrence.
pub fn register_path_entry(path_file: &Path, entry: &str) -> Result<bool> {
    let current = match fs::read_to_string(path_file) {
        Ok(s) => s.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(Error::msg(format!(
                "failed to read {}: {e}",
                path_file.display()
            )));
        }
    };
    if current.contains(entry) {
        return Ok(false);
    }
    let updated = if current.is_empty() {
        entry.to_string()
    } else {
        format!("{current}{PATH_LIST_SEPARATOR}{entry}")
    };
    if let Some(parent) = path_file.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    fs::write(path_file, format!("{updated}\n"))
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path_file.display())))?;
    Ok(true)
}

fn install_requirements(desc: &ResourceDescriptor, env: &Environment, rel: &str) -> Result<()> {
    let Some(pip) = env.venv_pip.as_ref() else {
        return Err(Error::msg(format!(
            "resource '{}' requirements install needs the virtual environment's pip",
            desc.name
        )));
    };
    let requirements: PathBuf = {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            desc.destination.join(p)
        }
    };
    if !requirements.is_file() {
        return Err(Error::msg(format!(
            "requirements file missing: {}",
            requirements.display()
        )));
    }
    let mut cmd = Command::new(pip);
    cmd.arg("install").arg("-r").arg(&requirements);
    let out = process::output(&mut cmd)?;
    if !out.success() {
        return Err(Error::msg(format!(
            "requirements install failed: {}",
            out.summary()
        )));
    }
    Ok(())
}
