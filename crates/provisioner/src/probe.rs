use std::fs;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::manifest::{PostAction, ResourceDescriptor, ResourceSource};
use crate::process;
use crate::transport::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    PresentSatisfying,
    PresentVersionMismatch,
}

/// Read-only presence check; never mutates filesystem state. Version queries
/// run the probed binary or `pip show`, both side-effect free.
pub fn probe(desc: &ResourceDescriptor, env: &Environment) -> Result<PresenceState> {
    match &desc.source {
        ResourceSource::Tool(tool) => {
            let Some(bin) = env.find_on_path(&tool.bin) else {
                return Ok(PresenceState::Absent);
            };
            let Some(want) = tool.version.as_deref().map(str::trim).filter(|s| !s.is_empty())
            else {
                return Ok(PresenceState::PresentSatisfying);
            };
            let mut cmd = Command::new(&bin);
            cmd.arg("--version");
            match process::output(&mut cmd) {
                Ok(out) if out.success() => {
                    let text = format!("{}\n{}", out.stdout, out.stderr);
                    if text.contains(want) {
                        Ok(PresenceState::PresentSatisfying)
                    } else {
                        Ok(PresenceState::PresentVersionMismatch)
                    }
                }
                // Callable exists but won't answer a version query; treat the
                // constraint as unverifiable rather than forcing a reinstall.
                _ => Ok(PresenceState::PresentSatisfying),
            }
        }
        ResourceSource::PythonPackage(pkg) => {
            let Some(pip) = env.venv_pip.as_ref() else {
                return Ok(PresenceState::Absent);
            };
            let mut cmd = Command::new(pip);
            cmd.arg("show").arg(&desc.name);
            let out = process::output(&mut cmd)?;
            if !out.success() {
                return Ok(PresenceState::Absent);
            }
            let Some(want) = pkg
                .spec
                .as_deref()
                .and_then(|s| s.split_once("==").map(|(_, v)| v.trim()))
                .filter(|v| !v.is_empty())
            else {
                return Ok(PresenceState::PresentSatisfying);
            };
            let installed = out
                .stdout
                .lines()
                .find_map(|l| l.strip_prefix("Version:"))
                .map(str::trim)
                .unwrap_or("");
            if installed == want {
                Ok(PresenceState::PresentSatisfying)
            } else {
                Ok(PresenceState::PresentVersionMismatch)
            }
        }
        ResourceSource::GitRepository(_) => {
            // Marker check only; verifying the checked-out commit belongs to
            // the resolver's update flow.
            if desc.destination.join(".git").exists() {
                Ok(PresenceState::PresentSatisfying)
            } else {
                Ok(PresenceState::Absent)
            }
        }
        ResourceSource::DataFile(df) => {
            if desc
                .post_actions
                .iter()
                .any(|a| matches!(a, PostAction::ExtractArchive))
            {
                return Ok(if dir_nonempty(&desc.destination) {
                    PresenceState::PresentSatisfying
                } else {
                    PresenceState::Absent
                });
            }

            let meta = match fs::metadata(&desc.destination) {
                Ok(m) if m.is_file() => m,
                _ => return Ok(PresenceState::Absent),
            };
            // A size or checksum mismatch means a truncated or wrong file;
            // classify as Absent so the fetch re-runs.
            if let Some(size) = df.size {
                if meta.len() != size {
                    return Ok(PresenceState::Absent);
                }
            }
            if let Some(want) = df.sha256.as_deref() {
                let got = sha256_file_hex(&desc.destination)?;
                if got != want {
                    return Ok(PresenceState::Absent);
                }
            }
            Ok(PresenceState::PresentSatisfying)
        }
    }
}

/// Default reinstall policy: a version mismatch only forces a refetch for
/// pinned exact-version requirements.
pub fn reinstall_on_mismatch(desc: &ResourceDescriptor) -> bool {
    match &desc.source {
        ResourceSource::Tool(tool) => tool.pinned,
        ResourceSource::PythonPackage(pkg) => pkg
            .spec
            .as_deref()
            .map(|s| s.contains("=="))
            .unwrap_or(false),
        _ => false,
    }
}

fn dir_nonempty(p: &Path) -> bool {
    fs::read_dir(p)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
