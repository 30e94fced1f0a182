//! Expansion of requested install names into on-disk candidates:
//! `@executable_path`/`@loader_path`/`@rpath` substitution, search and
//! fallback lists, root prefixes, suffix preference, and versioned
//! overrides, in the documented precedence.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::PackedVersion;
use crate::mach;

/// The search configuration captured from the environment at boot (all of
/// it empty/false for restricted processes, which ignore these controls
/// except that restriction itself also prunes `@`-expansion).
#[derive(Debug, Default, Clone)]
pub struct SearchConfig {
    pub framework_paths: Vec<PathBuf>,
    pub fallback_framework_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    pub fallback_library_paths: Vec<PathBuf>,
    /// Prefixes tried, in order, in front of absolute paths.
    pub root_paths: Vec<PathBuf>,
    /// Inserted before the extension of every candidate; the suffixed
    /// file is preferred when both exist.
    pub image_suffix: Option<String>,
    pub versioned_library_paths: Vec<PathBuf>,
    pub versioned_framework_paths: Vec<PathBuf>,
    /// setuid/setgid, restricted entitlement, or `__RESTRICT` section.
    pub restricted: bool,
}

/// The inherited `@rpath` expansion list: the loading image's own rpath
/// entries chained in front of its loader's, back to the root of the
/// load.
#[derive(Debug, Clone, Copy)]
pub struct RPathChain<'a> {
    pub parent: Option<&'a RPathChain<'a>>,
    pub rpaths: &'a [String],
}

impl<'a> RPathChain<'a> {
    pub const EMPTY: RPathChain<'static> = RPathChain {
        parent: None,
        rpaths: &[],
    };

    pub fn new(parent: Option<&'a RPathChain<'a>>, rpaths: &'a [String]) -> Self {
        RPathChain { parent, rpaths }
    }

    /// All entries, own first, then inherited.
    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        let mut lists = Vec::new();
        let mut cursor = Some(self);
        while let Some(chain) = cursor {
            lists.push(chain.rpaths);
            cursor = chain.parent;
        }
        lists.into_iter().flatten().map(|s| s.as_str())
    }
}

/// Everything needed to expand one requested name.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub requested: &'a str,
    /// Directory of the main executable (for `@executable_path`).
    pub executable_dir: Option<&'a Path>,
    /// Directory of the image doing the loading (for `@loader_path`).
    pub loader_dir: Option<&'a Path>,
    /// The loader is the main executable itself.
    pub loader_is_main: bool,
    pub rpaths: RPathChain<'a>,
}

/// If `path` looks like `…/Foo.framework/…/Foo`, the partial path from
/// the framework directory down (`Foo.framework/Versions/A/Foo`).
pub fn framework_partial_path(path: &str) -> Option<&str> {
    let leaf = path.rsplit('/').next()?;
    let needle = format!("{}.framework/", leaf);
    let start = path.find(&needle)?;
    Some(&path[start..])
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `libfoo.dylib` + `_debug` → `libfoo_debug.dylib`; extensionless
/// (framework) leaves get the suffix appended.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let new_name = match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}{}", &name[..dot], suffix, &name[dot..]),
        _ => format!("{}{}", name, suffix),
    };
    path.with_file_name(new_name)
}

/// Produce the ordered candidate list for one request. The first entry
/// that exists on disk wins; suffixed variants immediately precede their
/// plain form.
pub fn candidates(req: &ResolveRequest<'_>, config: &SearchConfig) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if let Some(suffix) = &config.image_suffix {
            let suffixed = with_suffix(&path, suffix);
            if !out.contains(&suffixed) {
                out.push(suffixed);
            }
        }
        if !out.contains(&path) {
            out.push(path);
        }
    };

    let requested = req.requested;

    // Step 1: @-substitutions. In restricted processes the loader-relative
    // forms are rejected outright, not expanded.
    if let Some(rest) = requested.strip_prefix("@executable_path/") {
        if !config.restricted {
            if let Some(dir) = req.executable_dir {
                push(dir.join(rest));
            }
        }
    } else if let Some(rest) = requested.strip_prefix("@loader_path/") {
        let rejected = config.restricted && req.loader_is_main;
        if !rejected {
            if let Some(dir) = req.loader_dir {
                push(dir.join(rest));
            }
        }
    } else if let Some(rest) = requested.strip_prefix("@rpath/") {
        for rpath in req.rpaths.iter() {
            if let Some(dir_rest) = rpath.strip_prefix("@loader_path/") {
                let rejected = config.restricted && req.loader_is_main;
                if !rejected {
                    if let Some(dir) = req.loader_dir {
                        push(dir.join(dir_rest).join(rest));
                    }
                }
            } else if let Some(dir_rest) = rpath.strip_prefix("@executable_path/") {
                if !config.restricted {
                    if let Some(dir) = req.executable_dir {
                        push(dir.join(dir_rest).join(rest));
                    }
                }
            } else if rpath.starts_with('/') {
                push(Path::new(rpath).join(rest));
            } else if !config.restricted {
                // Bare-relative rpath entries are cwd-relative and
                // rejected for restricted processes.
                push(Path::new(rpath).join(rest));
            }
        }
    } else {
        // Step 2: root prefixes in front of the absolute path.
        if requested.starts_with('/') {
            for root in &config.root_paths {
                push(root.join(&requested[1..]));
            }
        }
        // Step 3: the path exactly as requested.
        push(PathBuf::from(requested));
    }

    // Step 4: framework search paths.
    let partial = framework_partial_path(requested);
    if let Some(partial) = partial {
        for dir in &config.framework_paths {
            push(dir.join(partial));
        }
    }
    // Step 5: library search paths with the leaf name.
    for dir in &config.library_paths {
        push(dir.join(leaf_name(requested)));
    }
    // Step 6: fallback paths, skipped for restricted processes.
    if !config.restricted {
        if let Some(partial) = partial {
            for dir in &config.fallback_framework_paths {
                push(dir.join(partial));
            }
        }
        for dir in &config.fallback_library_paths {
            push(dir.join(leaf_name(requested)));
        }
    }
    out
}

/// Walk the candidate list and return the first path that exists, with
/// its metadata.
pub fn resolve(req: &ResolveRequest<'_>, config: &SearchConfig) -> Option<(PathBuf, fs::Metadata)> {
    for candidate in candidates(req, config) {
        match fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() => {
                debug!(target: "libraries", "resolved {:?} -> {:?}", req.requested, candidate);
                return Some((candidate, meta));
            }
            _ => {}
        }
    }
    None
}

/// Step 8, the override table: a dylib in a versioned directory whose
/// install name matches and whose current version is newer than
/// `installed` replaces the system copy.
pub fn versioned_override(
    config: &SearchConfig,
    host: mach::cputype::CpuId,
    install_name: &str,
    installed: PackedVersion,
) -> Option<PathBuf> {
    let dirs = config
        .versioned_library_paths
        .iter()
        .chain(&config.versioned_framework_paths);
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            let Ok((offset, _)) = mach::find_host_slice(&bytes, host) else {
                continue;
            };
            let Ok(file) = mach::MachFile::parse(&bytes[offset..], host) else {
                continue;
            };
            if let Some(id) = &file.id {
                if id.name == install_name && PackedVersion(id.current_version) > installed {
                    debug!(
                        target: "libraries",
                        "versioned override: {:?} (version {}) replaces {}",
                        path,
                        PackedVersion(id.current_version),
                        install_name
                    );
                    return Some(path);
                }
            }
        }
    }
    None
}
