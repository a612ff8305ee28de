use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Tool,
    PythonPackage,
    GitRepository,
    DataFile,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tool => "tool",
            ResourceKind::PythonPackage => "python-package",
            ResourceKind::GitRepository => "git-repository",
            ResourceKind::DataFile => "data-file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
    /// Extract the fetched archive into the destination directory.
    ExtractArchive,
    /// Append the destination to the persisted PATH value if absent.
    RegisterPath,
    /// Install a requirements file (relative to destination) into the venv.
    InstallRequirements(String),
}

impl PostAction {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "extract" {
            return Ok(PostAction::ExtractArchive);
        }
        if raw == "register-path" {
            return Ok(PostAction::RegisterPath);
        }
        if let Some(rel) = raw.strip_prefix("requirements:") {
            let rel = rel.trim();
            if rel.is_empty() {
                return Err(Error::msg("'requirements:' post action names no file"));
            }
            return Ok(PostAction::InstallRequirements(rel.to_string()));
        }
        Err(Error::msg(format!(
            "unknown post action '{raw}' (expected 'extract', 'register-path', or 'requirements:<file>')"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Callable probed on PATH; defaults to the resource name.
    pub bin: String,
    pub version: Option<String>,
    /// Exact-version requirement: a version mismatch forces reinstall.
    pub pinned: bool,
    /// Install command argv (package manager invocation, configuration data).
    pub install: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PythonPackageSpec {
    /// Package index requirement, e.g. "torch==2.1.0".
    pub spec: Option<String>,
    /// Local prebuilt wheel; takes precedence over `spec`.
    pub wheel: Option<PathBuf>,
    /// Alternate package index (GPU-variant wheels live off-index).
    pub index_url: Option<String>,
    /// Transient build-flag variables applied to the install child only.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GitRepositorySpec {
    pub url: String,
    pub commit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DataFileSpec {
    pub url: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ResourceSource {
    Tool(ToolSpec),
    PythonPackage(PythonPackageSpec),
    GitRepository(GitRepositorySpec),
    DataFile(DataFileSpec),
}

#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub name: String,
    pub destination: PathBuf,
    pub group: Option<String>,
    pub post_actions: Vec<PostAction>,
    pub source: ResourceSource,
}

impl ResourceDescriptor {
    pub fn kind(&self) -> ResourceKind {
        match &self.source {
            ResourceSource::Tool(_) => ResourceKind::Tool,
            ResourceSource::PythonPackage(_) => ResourceKind::PythonPackage,
            ResourceSource::GitRepository(_) => ResourceKind::GitRepository,
            ResourceSource::DataFile(_) => ResourceKind::DataFile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub install_root: PathBuf,
    pub log_dir: PathBuf,
    pub max_parallel: usize,
    pub retry_bound: u32,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub settings: Settings,
    pub resources: Vec<ResourceDescriptor>,
}

impl Manifest {
    pub fn has_python_packages(&self) -> bool {
        self.resources
            .iter()
            .any(|r| r.kind() == ResourceKind::PythonPackage)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Overrides `[settings].install_root`; defaults to the manifest's directory.
    pub install_root: Option<PathBuf>,
    /// Enabled optional resource groups; ungrouped resources always load.
    pub groups: BTreeSet<String>,
}

fn default_max_parallel() -> usize {
    2
}

fn default_retry_bound() -> u32 {
    1
}

fn default_log_dir() -> String {
    "logs".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSettings {
    install_root: Option<String>,
    #[serde(default = "default_log_dir")]
    log_dir: String,
    #[serde(default = "default_max_parallel")]
    max_parallel: usize,
    #[serde(default = "default_retry_bound")]
    retry_bound: u32,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            install_root: None,
            log_dir: default_log_dir(),
            max_parallel: default_max_parallel(),
            retry_bound: default_retry_bound(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTool {
    name: String,
    bin: Option<String>,
    version: Option<String>,
    pinned: bool,
    install: Vec<String>,
    destination: Option<String>,
    group: Option<String>,
    post: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPythonPackage {
    name: String,
    spec: Option<String>,
    wheel: Option<String>,
    index_url: Option<String>,
    env: BTreeMap<String, String>,
    group: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGitRepo {
    name: String,
    url: String,
    commit: Option<String>,
    destination: Option<String>,
    group: Option<String>,
    post: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFile {
    name: String,
    url: String,
    destination: Option<String>,
    size: Option<u64>,
    sha256: Option<String>,
    group: Option<String>,
    post: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawManifest {
    settings: RawSettings,
    tools: Vec<RawTool>,
    python_packages: Vec<RawPythonPackage>,
    git_repos: Vec<RawGitRepo>,
    files: Vec<RawFile>,
}

const KNOWN_SECTIONS: [&str; 5] = ["settings", "tools", "python_packages", "git_repos", "files"];

pub fn load(path: &Path, opts: &LoadOptions) -> Result<Manifest> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read manifest {}: {e}", path.display())))?;
    let value: toml::Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    from_value(path, value, opts)
}

/// Parse and validate an already-loaded manifest document. Fail-fast: every
/// structural problem is rejected here, before any network activity.
pub fn from_value(path: &Path, value: toml::Value, opts: &LoadOptions) -> Result<Manifest> {
    if let Some(tbl) = value.as_table() {
        for key in tbl.keys() {
            if !KNOWN_SECTIONS.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "unknown resource kind section '{key}' in {} (known: {})",
                    path.display(),
                    KNOWN_SECTIONS.join(", ")
                )));
            }
        }
    }

    let raw: RawManifest = value
        .try_into()
        .map_err(|e| Error::msg(format!("invalid manifest {}: {e}", path.display())))?;

    let manifest_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let install_root = resolve_install_root(&manifest_dir, &raw.settings, opts)?;
    let log_dir = {
        let p = PathBuf::from(raw.settings.log_dir.trim());
        if p.as_os_str().is_empty() {
            return Err(Error::msg("settings.log_dir is empty"));
        }
        if p.is_absolute() { p } else { install_root.join(p) }
    };

    let settings = Settings {
        install_root: install_root.clone(),
        log_dir,
        max_parallel: raw.settings.max_parallel.max(1),
        retry_bound: raw.settings.retry_bound,
    };

    let mut resources = Vec::new();

    for t in &raw.tools {
        let name = required_name("tools", &t.name)?;
        let dest = normalize_destination(
            &name,
            t.destination.as_deref().unwrap_or("."),
            &install_root,
        )?;
        if t.install.is_empty() {
            return Err(Error::msg(format!(
                "tool '{name}' has no install command"
            )));
        }
        resources.push(ResourceDescriptor {
            name: name.clone(),
            destination: dest,
            group: clean_group(t.group.as_deref()),
            post_actions: parse_post_actions(&name, ResourceKind::Tool, &t.post)?,
            source: ResourceSource::Tool(ToolSpec {
                bin: t
                    .bin
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(&name)
                    .to_string(),
                version: t.version.clone(),
                pinned: t.pinned,
                install: t.install.clone(),
            }),
        });
    }

    for p in &raw.python_packages {
        let name = required_name("python_packages", &p.name)?;
        if p.spec.is_none() && p.wheel.is_none() {
            return Err(Error::msg(format!(
                "python package '{name}' needs either 'spec' or 'wheel'"
            )));
        }
        let wheel = p
            .wheel
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|w| {
                let pb = PathBuf::from(w);
                if pb.is_absolute() { pb } else { install_root.join(pb) }
            });
        resources.push(ResourceDescriptor {
            name: name.clone(),
            destination: install_root.clone(),
            group: clean_group(p.group.as_deref()),
            post_actions: Vec::new(),
            source: ResourceSource::PythonPackage(PythonPackageSpec {
                spec: p.spec.clone(),
                wheel,
                index_url: p.index_url.clone(),
                env: p.env.clone(),
            }),
        });
    }

    for g in &raw.git_repos {
        let name = required_name("git_repos", &g.name)?;
        if g.url.trim().is_empty() {
            return Err(Error::msg(format!("git repo '{name}' has no url")));
        }
        let dest = normalize_destination(
            &name,
            g.destination.as_deref().unwrap_or(&name),
            &install_root,
        )?;
        resources.push(ResourceDescriptor {
            name: name.clone(),
            destination: dest,
            group: clean_group(g.group.as_deref()),
            post_actions: parse_post_actions(&name, ResourceKind::GitRepository, &g.post)?,
            source: ResourceSource::GitRepository(GitRepositorySpec {
                url: g.url.trim().to_string(),
                commit: g.commit.as_deref().map(str::trim).map(String::from),
            }),
        });
    }

    for f in &raw.files {
        let name = required_name("files", &f.name)?;
        if f.url.trim().is_empty() {
            return Err(Error::msg(format!("file '{name}' has no url")));
        }
        if let Some(sha) = f.sha256.as_deref() {
            let sha = sha.trim();
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::msg(format!(
                    "file '{name}' has an invalid sha256 hint"
                )));
            }
        }
        let dest = normalize_destination(
            &name,
            f.destination.as_deref().unwrap_or(&name),
            &install_root,
        )?;
        resources.push(ResourceDescriptor {
            name: name.clone(),
            destination: dest,
            group: clean_group(f.group.as_deref()),
            post_actions: parse_post_actions(&name, ResourceKind::DataFile, &f.post)?,
            source: ResourceSource::DataFile(DataFileSpec {
                url: f.url.trim().to_string(),
                size: f.size,
                sha256: f.sha256.as_deref().map(|s| s.trim().to_ascii_lowercase()),
            }),
        });
    }

    let mut seen = BTreeSet::new();
    for r in &resources {
        if !seen.insert(r.name.clone()) {
            return Err(Error::msg(format!(
                "duplicate resource name '{}' in {}",
                r.name,
                path.display()
            )));
        }
    }

    // Group selection arrives pre-resolved from the caller; the engine never
    // prompts. Ungrouped resources are unconditional.
    resources.retain(|r| match &r.group {
        Some(g) => opts.groups.contains(g),
        None => true,
    });

    // Files and git repos own their destination exclusively; a shared target
    // would let two parallel fetches write the same path. Checked after group
    // filtering so mutually exclusive groups may offer variants of one path.
    // Tools and python packages all point at the install root, which is fine.
    let mut dest_seen: BTreeMap<PathBuf, String> = BTreeMap::new();
    for r in &resources {
        if !matches!(
            r.kind(),
            ResourceKind::DataFile | ResourceKind::GitRepository
        ) {
            continue;
        }
        if let Some(prev) = dest_seen.insert(r.destination.clone(), r.name.clone()) {
            return Err(Error::msg(format!(
                "resources '{prev}' and '{}' share destination {}",
                r.name,
                r.destination.display()
            )));
        }
    }

    Ok(Manifest {
        path: path.to_path_buf(),
        settings,
        resources,
    })
}

fn required_name(section: &str, raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::msg(format!("{section}[].name is empty")));
    }
    Ok(name.to_string())
}

fn clean_group(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn parse_post_actions(
    name: &str,
    kind: ResourceKind,
    raw: &[String],
) -> Result<Vec<PostAction>> {
    let mut out = Vec::with_capacity(raw.len());
    for s in raw {
        let action = PostAction::parse(s)
            .map_err(|e| Error::msg(format!("resource '{name}': {e}")))?;
        match &action {
            PostAction::ExtractArchive if kind != ResourceKind::DataFile => {
                return Err(Error::msg(format!(
                    "resource '{name}': 'extract' only applies to data files"
                )));
            }
            PostAction::InstallRequirements(_) if kind == ResourceKind::PythonPackage => {
                return Err(Error::msg(format!(
                    "resource '{name}': 'requirements:' applies to git repos and data files"
                )));
            }
            _ => {}
        }
        out.push(action);
    }
    Ok(out)
}

fn resolve_install_root(
    manifest_dir: &Path,
    settings: &RawSettings,
    opts: &LoadOptions,
) -> Result<PathBuf> {
    let chosen = opts
        .install_root
        .clone()
        .or_else(|| {
            settings
                .install_root
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| manifest_dir.to_path_buf());

    let abs = if chosen.is_absolute() {
        chosen
    } else {
        let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
        cwd.join(chosen)
    };
    Ok(normalize_path(&abs))
}

/// Normalize a destination: trim, strip trailing separators, resolve relative
/// paths under the install root, reject '..', and require the result absolute.
fn normalize_destination(name: &str, raw: &str, install_root: &Path) -> Result<PathBuf> {
    let trimmed = raw.trim().trim_end_matches(['/', '\\']);
    // "/" trims to empty; fall back to the untrimmed value for bare roots.
    let cleaned = if trimmed.is_empty() { raw.trim() } else { trimmed };
    if cleaned.is_empty() {
        return Err(Error::msg(format!("resource '{name}': destination is empty")));
    }
    let pb = Path::new(cleaned);
    if pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!(
            "resource '{name}': destination '{raw}' contains '..'"
        )));
    }
    let joined = if pb.is_absolute() {
        pb.to_path_buf()
    } else {
        install_root.join(pb)
    };
    let out = normalize_path(&joined);
    if !out.is_absolute() {
        return Err(Error::msg(format!(
            "resource '{name}': destination '{raw}' did not resolve to an absolute path"
        )));
    }
    Ok(out)
}

fn normalize_path(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_separator_is_stripped() {
        let root = Path::new("/opt/app");
        let a = normalize_destination("x", "models/vae/", root).unwrap();
        let b = normalize_destination("x", "models/vae", root).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let root = Path::new("/opt/app");
        let err = normalize_destination("x", "../escape", root).unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn dot_destination_means_install_root() {
        let root = Path::new("/opt/app");
        let d = normalize_destination("x", ".", root).unwrap();
        assert_eq!(d, root);
    }
}
