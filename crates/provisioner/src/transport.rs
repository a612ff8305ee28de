use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::{PostAction, ResourceDescriptor, ResourceSource};

/// Hosts block default client signatures on some model mirrors; present a
/// current browser signature instead.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

pub const ARIA2_CONNECTIONS: u32 = 16;
pub const ARIA2_CHUNK: &str = "1M";

/// Transport availability, probed once per run.
#[derive(Debug, Clone)]
pub struct Environment {
    path_dirs: Vec<PathBuf>,
    pub aria2: Option<PathBuf>,
    pub git: Option<PathBuf>,
    pub venv_pip: Option<PathBuf>,
}

impl Environment {
    pub fn detect(venv_path: Option<&Path>) -> Self {
        let path_dirs = std::env::var_os("PATH")
            .map(|v| std::env::split_paths(&v).collect())
            .unwrap_or_default();
        Self::from_path_dirs(path_dirs, venv_path)
    }

    /// Same detection against an explicit PATH list (tests inject temp dirs).
    pub fn from_path_dirs(path_dirs: Vec<PathBuf>, venv_path: Option<&Path>) -> Self {
        let mut env = Self {
            path_dirs,
            aria2: None,
            git: None,
            venv_pip: None,
        };
        env.aria2 = env.find_on_path("aria2c");
        env.git = env.find_on_path("git");
        env.venv_pip = venv_path.map(venv_pip_path).filter(|p| p.is_file());
        env
    }

    pub fn find_on_path(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.path_dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Some(candidate);
            }
            #[cfg(windows)]
            {
                let exe = dir.join(format!("{name}.exe"));
                if exe.is_file() {
                    return Some(exe);
                }
            }
        }
        None
    }

    /// Re-probe a single tool after its install step; PATH mutations made by
    /// the installer become visible to later descriptors this way.
    pub fn refresh_tool(&mut self, bin: &str) {
        match bin {
            "aria2c" => self.aria2 = self.find_on_path("aria2c"),
            "git" => self.git = self.find_on_path("git"),
            _ => {}
        }
    }
}

pub fn venv_pip_path(venv: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        venv.join("Scripts").join("pip.exe")
    }
    #[cfg(not(windows))]
    {
        venv.join("bin").join("pip")
    }
}

fn is_executable(p: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        p.is_file()
            && p.metadata()
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        p.is_file()
    }
}

/// A selected plan carries the discovered binary path where one applies; the
/// executor spawns exactly that file and never re-resolves against the
/// ambient PATH, which may disagree with the probed `Environment`.
#[derive(Debug, Clone)]
pub enum TransportPlan {
    /// Accelerated multi-connection download for large files.
    Aria2 {
        bin: PathBuf,
        url: String,
        dest: PathBuf,
        connections: u32,
        chunk: &'static str,
    },
    /// Single-stream HTTP fallback, available before any bootstrap step.
    Http { url: String, dest: PathBuf },
    GitClone {
        git: PathBuf,
        url: String,
        dest: PathBuf,
        commit: Option<String>,
    },
    Pip {
        pip: PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// Package-manager invocation for tool installs (configuration data).
    Install { argv: Vec<String> },
}

impl TransportPlan {
    pub fn describe(&self) -> String {
        match self {
            TransportPlan::Aria2 {
                url, connections, ..
            } => format!("aria2 x{connections} {url}"),
            TransportPlan::Http { url, .. } => format!("http {url}"),
            TransportPlan::GitClone { url, commit, .. } => match commit {
                Some(c) => format!("git clone {url} @ {c}"),
                None => format!("git clone {url}"),
            },
            TransportPlan::Pip { args, .. } => format!("pip {}", args.join(" ")),
            TransportPlan::Install { argv } => format!("install: {}", argv.join(" ")),
        }
    }
}

/// Where a data file fetch lands on disk. Archive descriptors use their
/// destination as a directory and drop the archive next to its content.
pub fn download_path(desc: &ResourceDescriptor) -> PathBuf {
    let ResourceSource::DataFile(df) = &desc.source else {
        return desc.destination.clone();
    };
    if desc
        .post_actions
        .iter()
        .any(|a| matches!(a, PostAction::ExtractArchive))
    {
        desc.destination.join(url_basename(&df.url, &desc.name))
    } else {
        desc.destination.clone()
    }
}

fn url_basename(url: &str, fallback: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// First match wins: aria2 for data files when present, plain HTTP otherwise;
/// git and pip transports are fixed by kind. The fallback chain exists
/// because the accelerated downloader is itself a Tool descriptor and the
/// engine must run before that bootstrap completes.
pub fn select(desc: &ResourceDescriptor, env: &Environment) -> Result<TransportPlan> {
    match &desc.source {
        ResourceSource::DataFile(df) => {
            let dest = download_path(desc);
            if let Some(bin) = env.aria2.clone() {
                Ok(TransportPlan::Aria2 {
                    bin,
                    url: df.url.clone(),
                    dest,
                    connections: ARIA2_CONNECTIONS,
                    chunk: ARIA2_CHUNK,
                })
            } else {
                Ok(TransportPlan::Http {
                    url: df.url.clone(),
                    dest,
                })
            }
        }
        ResourceSource::GitRepository(repo) => {
            let Some(git) = env.git.clone() else {
                return Err(Error::msg(format!(
                    "resource '{}' needs git, which is not on PATH",
                    desc.name
                )));
            };
            Ok(TransportPlan::GitClone {
                git,
                url: repo.url.clone(),
                dest: desc.destination.clone(),
                commit: repo.commit.clone(),
            })
        }
        ResourceSource::PythonPackage(pkg) => {
            let Some(pip) = env.venv_pip.clone() else {
                return Err(Error::msg(format!(
                    "resource '{}' needs the virtual environment's pip",
                    desc.name
                )));
            };
            let mut args = vec!["install".to_string()];
            if let Some(wheel) = &pkg.wheel {
                // Index-free local install for prebuilt binary packages.
                args.push("--no-index".into());
                args.push(wheel.display().to_string());
            } else if let Some(spec) = &pkg.spec {
                if let Some(index) = &pkg.index_url {
                    args.push("--index-url".into());
                    args.push(index.clone());
                }
                args.push(spec.clone());
            }
            Ok(TransportPlan::Pip {
                pip,
                args,
                env: pkg.env.clone(),
            })
        }
        ResourceSource::Tool(tool) => Ok(TransportPlan::Install {
            argv: tool.install.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DataFileSpec;

    fn data_file(name: &str, url: &str, post: Vec<PostAction>) -> ResourceDescriptor {
        ResourceDescriptor {
            name: name.into(),
            destination: PathBuf::from("/opt/app/models").join(name),
            group: None,
            post_actions: post,
            source: ResourceSource::DataFile(DataFileSpec {
                url: url.into(),
                size: None,
                sha256: None,
            }),
        }
    }

    fn bare_env() -> Environment {
        Environment::from_path_dirs(Vec::new(), None)
    }

    #[test]
    fn data_file_falls_back_to_http_without_aria2() {
        let desc = data_file("vae", "https://host/vae.safetensors", Vec::new());
        let plan = select(&desc, &bare_env()).unwrap();
        assert!(matches!(plan, TransportPlan::Http { .. }));
    }

    #[test]
    fn data_file_prefers_aria2_when_available() {
        let desc = data_file("vae", "https://host/vae.safetensors", Vec::new());
        let mut env = bare_env();
        env.aria2 = Some(PathBuf::from("/usr/bin/aria2c"));
        let plan = select(&desc, &env).unwrap();
        match plan {
            TransportPlan::Aria2 {
                bin, connections, ..
            } => {
                assert_eq!(bin, PathBuf::from("/usr/bin/aria2c"));
                assert_eq!(connections, ARIA2_CONNECTIONS);
            }
            other => panic!("expected aria2 plan, got {}", other.describe()),
        }
    }

    #[test]
    fn archive_descriptor_downloads_into_destination_dir() {
        let desc = data_file(
            "pack",
            "https://host/pack.tar.gz?token=x",
            vec![PostAction::ExtractArchive],
        );
        let path = download_path(&desc);
        assert_eq!(path, PathBuf::from("/opt/app/models/pack/pack.tar.gz"));
    }
}
