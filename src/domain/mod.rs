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
use std::collections::BTreeSet;
use std::time::SystemTime;

use semver::Version;

/// The finalizer token that marks a release's payload as still present on disk.
pub(crate) const FINALIZER_FS_EXISTS: &str = "fs-exists";

/// The finalizer token that marks a source as having at least one deployed release.
pub(crate) const FINALIZER_RELEASE_EXISTS: &str = "release-exists";

/// The label key under which the lowercased phase is mirrored for external selection.
pub(crate) const LABEL_STATUS: &str = "status";

/// The lifecycle phase of a single module release.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    /// Just created externally, not yet observed by the reconciler.
    None,
    /// Observed, waiting for the predictor to pick a winner.
    Pending,
    /// Currently enabled on disk.
    Deployed,
    /// Overtaken by a newer release, or bypassed as a skipped patch.
    Superseded,
    /// Could not be enabled; left alone until the next event.
    Suspended,
}

impl Phase {
    /// The lowercase form stored in the `status` label.
    pub(crate) fn label_value(&self) -> &'static str {
        match self {
            Phase::None => "none",
            Phase::Pending => "pending",
            Phase::Deployed => "deployed",
            Phase::Superseded => "superseded",
            Phase::Suspended => "suspended",
        }
    }
}

/// A concrete (module, version) release record as stored in the control plane.
#[derive(Clone, Debug)]
pub(crate) struct ModuleRelease {
    pub module_name: String,
    pub version: Version,
    pub weight: u32,
    pub module_source: String,
    pub phase: Phase,
    pub message: String,
    pub transition_time: SystemTime,
    pub finalizers: BTreeSet<String>,
    pub deletion_timestamp: Option<SystemTime>,
    pub labels: std::collections::BTreeMap<String, String>,
    /// Opaque per-record counter bumped by the control plane on every write;
    /// used only to detect no-op resync deliveries (see `controlplane::ChangeEvent`).
    pub resource_version: u64,
}

impl ModuleRelease {
    pub(crate) fn new(module_name: impl Into<String>, version: Version, weight: u32, module_source: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            version,
            weight,
            module_source: module_source.into(),
            phase: Phase::None,
            message: String::new(),
            transition_time: SystemTime::now(),
            finalizers: BTreeSet::new(),
            deletion_timestamp: None,
            labels: std::collections::BTreeMap::new(),
            resource_version: 1,
        }
    }

    /// The stringified `<moduleSource>/<moduleName>@<version>` identifier used as the work queue key.
    pub(crate) fn key(&self) -> String {
        release_key(&self.module_source, &self.module_name, &self.version)
    }

    pub(crate) fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.contains(token)
    }

    pub(crate) fn add_finalizer(&mut self, token: &str) -> bool {
        self.finalizers.insert(token.to_string())
    }

    pub(crate) fn remove_finalizer(&mut self, token: &str) -> bool {
        self.finalizers.remove(token)
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.labels.insert(LABEL_STATUS.to_string(), phase.label_value().to_string());
        self.transition_time = SystemTime::now();
    }

    /// The relative symlink target this release would be enabled under:
    /// `../<moduleName>/v<version>`.
    pub(crate) fn relative_target(&self) -> String {
        format!("../{}/v{}", self.module_name, self.version)
    }

    /// The weight-prefixed symlink name this release would own: `<weight>-<moduleName>`.
    pub(crate) fn symlink_name(&self) -> String {
        format!("{}-{}", self.weight, self.module_name)
    }
}

pub(crate) fn release_key(module_source: &str, module_name: &str, version: &Version) -> String {
    format!("{module_source}/{module_name}@{version}")
}

/// An opaque handle to a module source, whose only role here is carrying the
/// `release-exists` finalizer.
#[derive(Clone, Debug)]
pub(crate) struct ModuleSource {
    pub name: String,
    pub finalizers: BTreeSet<String>,
}

impl ModuleSource {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            finalizers: BTreeSet::new(),
        }
    }

    pub(crate) fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.contains(token)
    }
}
