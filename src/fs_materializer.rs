/*
 * This file is part of module-reconciler, licensed under the MIT License (MIT).
 *
 * Copyright (c) 2024 easybill GmbH
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use symlink::{remove_symlink_dir, symlink_dir};
use tokio::fs;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

/// The subdirectory of `ROOT` in which the weight-prefixed enable symlinks live.
const SYMLINKS_SUBDIR: &str = "modules";

/// The synthetic weight used for the fallback symlink location when no existing
/// symlink can be found for a module.
const FALLBACK_WEIGHT: u32 = 900;

/// Failure modes of [`FsMaterializer::enable`].
#[derive(Debug)]
pub(crate) enum MaterializeError {
    /// The payload directory that the new symlink should point at does not exist.
    PayloadMissing { relative_target: String },
    /// Any other filesystem failure.
    Io(std::io::Error),
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::PayloadMissing { relative_target } => {
                write!(f, "payload directory for {relative_target} does not exist")
            }
            MaterializeError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MaterializeError {}

impl From<std::io::Error> for MaterializeError {
    fn from(err: std::io::Error) -> Self {
        MaterializeError::Io(err)
    }
}

/// Creates, replaces and removes the payload directories and weight-prefixed
/// symlinks rooted at `ROOT` (the `externalModulesDir`). This is the only
/// component allowed to touch the filesystem under `ROOT`.
#[derive(Clone, Debug)]
pub(crate) struct FsMaterializer {
    root: PathBuf,
}

impl FsMaterializer {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn symlinks_dir(&self) -> PathBuf {
        self.root.join(SYMLINKS_SUBDIR)
    }

    /// The weight-prefixed symlink path a release owns: `ROOT/modules/<weight>-<moduleName>`.
    pub(crate) fn release_symlink(&self, symlink_name: &str) -> PathBuf {
        self.symlinks_dir().join(symlink_name)
    }

    /// The fallback symlink path used only when a module's own weight is
    /// genuinely unavailable to the caller: `ROOT/modules/900-<moduleName>`.
    pub(crate) fn fallback_symlink(&self, module_name: &str) -> PathBuf {
        self.symlinks_dir().join(format!("{FALLBACK_WEIGHT}-{module_name}"))
    }

    /// Walks `ROOT/modules` looking for an entry matching `^(([0-9]+)-)?<moduleName>$`.
    /// Returns the first match and stops descent.
    pub(crate) async fn find_current_symlink(&self, module_name: &str) -> Option<PathBuf> {
        let pattern = format!(r"^(([0-9]+)-)?{}$", regex::escape(module_name));
        let regex = Regex::new(&pattern).ok()?;

        let symlinks_dir = self.symlinks_dir();
        let directory_content = fs::read_dir(&symlinks_dir).await.ok()?;
        let mut entries = ReadDirStream::new(directory_content);
        while let Some(entry) = entries.next().await {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if let Some(file_name) = entry.file_name().to_str() {
                if regex.is_match(file_name) {
                    return Some(entry.path());
                }
            }
        }
        None
    }

    /// Resolves `symlink`'s target and compares it, normalized to be relative to
    /// the symlinks directory, against `expected_relative_target`.
    pub(crate) async fn is_payload_linked(&self, symlink: &Path, expected_relative_target: &str) -> bool {
        let resolved_target = match fs::read_link(symlink).await {
            Ok(target) => target,
            Err(_) => return false,
        };

        let normalized = if resolved_target.is_absolute() {
            match resolved_target.strip_prefix(&self.root) {
                Ok(stripped) => Path::new("..").join(stripped),
                Err(_) => resolved_target,
            }
        } else {
            resolved_target
        };

        normalized.to_string_lossy() == expected_relative_target
    }

    /// Switches a module's enabled version. Preconditions: the payload directory
    /// `ROOT/<relative_target>` (stripping a leading `../` and joining with `ROOT`)
    /// must exist. Not atomic across its three steps; see the crate's error handling notes.
    pub(crate) async fn enable(
        &self,
        current_symlink: Option<&Path>,
        new_symlink: &Path,
        relative_target: &str,
    ) -> Result<(), MaterializeError> {
        let payload_dir = self.absolutize_target(relative_target);
        if !fs::try_exists(&payload_dir).await.unwrap_or(false) {
            return Err(MaterializeError::PayloadMissing {
                relative_target: relative_target.to_string(),
            });
        }

        if let Some(current) = current_symlink {
            if fs::try_exists(current).await.unwrap_or(false) {
                remove_symlink_dir(current)?;
            }
        }
        if fs::try_exists(new_symlink).await.unwrap_or(false) {
            remove_symlink_dir(new_symlink)?;
        }
        if let Some(parent) = new_symlink.parent() {
            fs::create_dir_all(parent).await?;
        }
        symlink_dir(relative_target, new_symlink)?;
        Ok(())
    }

    /// Best-effort removal of a module's enable symlink.
    pub(crate) async fn disable(&self, symlink: &Path) {
        remove_symlink_dir(symlink).ok();
    }

    /// Recursively removes `ROOT/<moduleName>/v<version>`.
    pub(crate) async fn purge_payload(&self, module_name: &str, version: &semver::Version) -> std::io::Result<()> {
        let payload_dir = self.root.join(module_name).join(format!("v{version}"));
        match fs::remove_dir_all(&payload_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn payload_exists_sync(&self, module_name: &str, version: &semver::Version) -> bool {
        self.root.join(module_name).join(format!("v{version}")).exists()
    }

    /// Strips a leading `../` from `relative_target` and joins the remainder onto `ROOT`.
    fn absolutize_target(&self, relative_target: &str) -> PathBuf {
        let stripped = relative_target.strip_prefix("../").unwrap_or(relative_target);
        self.root.join(stripped)
    }
}
