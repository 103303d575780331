//! Locating the ffmpeg/ffprobe pair.
//!
//! Resolution tries, in order: an explicit hint (file or directory), the
//! executable search path, and finally a bundled layout next to the running
//! program. The first tier that yields *both* executables wins. The winner is
//! re-verified through the search-path machinery before it is handed out.

use crate::error::ToolchainError;
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Base name of the encoder executable
pub const ENCODER_NAME: &str = "ffmpeg";
/// Base name of the inspector executable
pub const INSPECTOR_NAME: &str = "ffprobe";
/// Bundled toolchains are looked for in subdirectories starting with this
const PRODUCT_PREFIX: &str = "ffmpeg";

/// Verified locations of the two external executables.
///
/// Built once at startup and passed by reference to everything that spawns
/// a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainPaths {
    encoder: PathBuf,
    inspector: PathBuf,
}

impl ToolchainPaths {
    pub fn new(encoder: impl Into<PathBuf>, inspector: impl Into<PathBuf>) -> Self {
        Self {
            encoder: encoder.into(),
            inspector: inspector.into(),
        }
    }

    /// Path to ffmpeg
    #[inline]
    pub fn encoder(&self) -> &Path {
        &self.encoder
    }

    /// Path to ffprobe
    #[inline]
    pub fn inspector(&self) -> &Path {
        &self.inspector
    }
}

/// Platform file name of an executable, e.g. `ffmpeg.exe` on Windows
#[inline]
pub fn executable_name(base: &str) -> String {
    format!("{}{}", base, std::env::consts::EXE_SUFFIX)
}

/// Resolves the toolchain with the process defaults: `PATH` from the
/// environment and the running executable's directory as bundle root.
pub fn resolve_toolchain(hint: Option<&Path>) -> Result<ToolchainPaths, ToolchainError> {
    ToolchainSearch::new(hint.map(Path::to_path_buf)).resolve()
}

/// Where to look for the toolchain. Every input is overridable so the search
/// can be pointed at a sandbox.
#[derive(Debug, Clone)]
pub struct ToolchainSearch {
    hint: Option<PathBuf>,
    bundle_dir: PathBuf,
    search_path: Option<OsString>,
    cwd: PathBuf,
}

impl ToolchainSearch {
    pub fn new(hint: Option<PathBuf>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let bundle_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());
        Self {
            hint,
            bundle_dir,
            search_path: std::env::var_os("PATH"),
            cwd,
        }
    }

    /// Overrides the directory that bundled executables are searched from
    pub fn bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_dir = dir.into();
        self
    }

    /// Overrides the executable search path (same syntax as `PATH`)
    pub fn search_path(mut self, paths: Option<OsString>) -> Self {
        self.search_path = paths;
        self
    }

    pub fn resolve(&self) -> Result<ToolchainPaths, ToolchainError> {
        let encoder_name = executable_name(ENCODER_NAME);
        let inspector_name = executable_name(INSPECTOR_NAME);
        let mut tried = Vec::new();

        let mut found = self
            .from_hint(&mut tried)
            .map(|paths| (paths, format!("argument '{}'", self.hint_display())));
        if found.is_none() {
            found = self
                .from_search_path(&encoder_name, &inspector_name, &mut tried)
                .map(|paths| (paths, "system PATH".to_string()));
        }
        if found.is_none() {
            found = self
                .from_bundle(&encoder_name, &inspector_name, &mut tried)
                .map(|paths| (paths, "bundled files".to_string()));
        }

        let (candidate, resolved_from) = match found {
            Some((paths, source)) => {
                info!(
                    "Toolchain candidate from {}: ffmpeg='{}', ffprobe='{}'",
                    source,
                    paths.encoder.display(),
                    paths.inspector.display()
                );
                (paths, source)
            }
            None => {
                warn!(
                    "Could not locate ffmpeg/ffprobe with any method, falling back to bare names"
                );
                (
                    ToolchainPaths::new(&encoder_name, &inspector_name),
                    "default names".to_string(),
                )
            }
        };

        let encoder = self.verify(ENCODER_NAME, &candidate.encoder, &resolved_from, &tried)?;
        let inspector = self.verify(INSPECTOR_NAME, &candidate.inspector, &resolved_from, &tried)?;
        info!("Final verified ffmpeg executable: {}", encoder.display());
        info!("Final verified ffprobe executable: {}", inspector.display());
        Ok(ToolchainPaths { encoder, inspector })
    }

    fn hint_display(&self) -> String {
        self.hint
            .as_ref()
            .map(|h| h.display().to_string())
            .unwrap_or_default()
    }

    /// Tier 1: a file is taken as ffmpeg itself with ffprobe next to it, a
    /// directory must hold both executables.
    fn from_hint(&self, tried: &mut Vec<String>) -> Option<ToolchainPaths> {
        let Some(hint) = &self.hint else {
            tried.push("  - Explicit toolchain path: not provided".to_string());
            return None;
        };
        let hint = fs::canonicalize(hint).unwrap_or_else(|_| hint.clone());

        let (encoder, inspector) = if hint.is_file() {
            let mut inspector_name = OsString::from(INSPECTOR_NAME);
            if let Some(ext) = hint.extension() {
                inspector_name.push(".");
                inspector_name.push(ext);
            }
            (hint.clone(), hint.with_file_name(inspector_name))
        } else if hint.is_dir() {
            (
                hint.join(executable_name(ENCODER_NAME)),
                hint.join(executable_name(INSPECTOR_NAME)),
            )
        } else {
            tried.push(format!(
                "  - Explicit toolchain path: {} (does not exist)",
                hint.display()
            ));
            return None;
        };

        tried.push(format!(
            "  - Explicit toolchain path: {} and {}",
            encoder.display(),
            inspector.display()
        ));
        let found = both_files(&encoder, &inspector);
        if found.is_none() {
            warn!(
                "Could not resolve ffmpeg/ffprobe from argument path: {}",
                hint.display()
            );
        }
        found
    }

    /// Tier 2: both executables on the search path
    fn from_search_path(
        &self,
        encoder_name: &str,
        inspector_name: &str,
        tried: &mut Vec<String>,
    ) -> Option<ToolchainPaths> {
        tried.push(format!(
            "  - System PATH for '{}' and '{}'",
            encoder_name, inspector_name
        ));
        let encoder = self.which(encoder_name)?;
        let inspector = self.which(inspector_name)?;
        Some(ToolchainPaths { encoder, inspector })
    }

    /// Tier 3: next to the running program, then inside `ffmpeg*`
    /// subdirectories (their `bin/` first, then their root).
    ///
    /// Subdirectories are visited in directory-listing order, which the
    /// platform does not guarantee to be stable.
    fn from_bundle(
        &self,
        encoder_name: &str,
        inspector_name: &str,
        tried: &mut Vec<String>,
    ) -> Option<ToolchainPaths> {
        let beside = &self.bundle_dir;
        tried.push(format!(
            "  - Next to the program: {}",
            beside.join(encoder_name).display()
        ));
        if let Some(paths) = both_files(&beside.join(encoder_name), &beside.join(inspector_name)) {
            return Some(paths);
        }

        tried.push(format!(
            "  - In '{}*' subdirectories of {} (e.g. ./ffmpeg-xyz/bin/{} or ./ffmpeg-xyz/{})",
            PRODUCT_PREFIX,
            beside.display(),
            encoder_name,
            encoder_name
        ));
        let entries = match fs::read_dir(beside) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", beside.display(), e);
                return None;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let dir = entry.path();
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !dir.is_dir() || !name.starts_with(PRODUCT_PREFIX) {
                continue;
            }
            for root in [dir.join("bin"), dir.clone()] {
                if let Some(paths) = both_files(&root.join(encoder_name), &root.join(inspector_name)) {
                    debug!("Found bundled toolchain in {}", root.display());
                    return Some(paths);
                }
            }
        }
        None
    }

    fn which(&self, name: impl AsRef<std::ffi::OsStr>) -> Option<PathBuf> {
        which::which_in(name, self.search_path.as_ref(), &self.cwd).ok()
    }

    fn verify(
        &self,
        tool: &'static str,
        candidate: &Path,
        resolved_from: &str,
        tried: &[String],
    ) -> Result<PathBuf, ToolchainError> {
        self.which(candidate)
            .ok_or_else(|| ToolchainError::NotFound {
                tool,
                candidate: candidate.to_path_buf(),
                resolved_from: resolved_from.to_string(),
                tried: tried.to_vec(),
            })
    }
}

fn both_files(encoder: &Path, inspector: &Path) -> Option<ToolchainPaths> {
    if encoder.is_file() && inspector.is_file() {
        Some(ToolchainPaths {
            encoder: fs::canonicalize(encoder).unwrap_or_else(|_| encoder.to_path_buf()),
            inspector: fs::canonicalize(inspector).unwrap_or_else(|_| inspector.to_path_buf()),
        })
    } else {
        None
    }
}
