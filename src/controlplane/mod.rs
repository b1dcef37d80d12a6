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
//! Contracts for the watch/list cache and typed client that this crate consumes
//! from the surrounding control plane. The reconciler core never depends on a
//! concrete backend; [`memory`] ships the one concrete implementation this
//! crate provides, an in-memory store used to run the binary standalone and to
//! drive the property and end-to-end tests in `tests/`. A production
//! deployment plugs in an implementation backed by the real control plane
//! (e.g. a generated API client) without touching the reconciler (see
//! DESIGN.md's open questions).

pub(crate) mod memory;

use async_trait::async_trait;

use crate::domain::{ModuleRelease, ModuleSource};

/// A change delivered by the watch/informer pair. `Updated` is delivered both for
/// genuine writes and for periodic resyncs that re-deliver an unchanged object;
/// callers distinguish the two by comparing `resource_version` against the last
/// value they observed for the same key (see `queue::subscribe_to_control_plane`).
#[derive(Clone, Debug)]
pub(crate) enum ChangeEvent {
    Added(ModuleRelease),
    Updated(ModuleRelease),
    Deleted(ModuleRelease),
}

impl ChangeEvent {
    pub(crate) fn release(&self) -> &ModuleRelease {
        match self {
            ChangeEvent::Added(release) | ChangeEvent::Updated(release) | ChangeEvent::Deleted(release) => release,
        }
    }
}

/// Lister + informer pair for `ModuleRelease`: list-by-label, get-by-name, and a
/// streaming change feed with resync.
#[async_trait]
pub(crate) trait ControlPlaneStore: Send + Sync {
    /// Fetches a single release by its work queue key. `Ok(None)` means NotFound,
    /// which is success: the caller forgets the item.
    async fn get_release(&self, key: &str) -> anyhow::Result<Option<ModuleRelease>>;

    /// Lists all releases belonging to the given module, equivalent to the
    /// label selector `module=<name>`.
    async fn list_releases_for_module(&self, module_name: &str) -> anyhow::Result<Vec<ModuleRelease>>;

    /// Lists every release currently known, regardless of phase.
    async fn list_all_releases(&self) -> anyhow::Result<Vec<ModuleRelease>>;

    /// Subscribes to the add/update/delete change feed. Only one live subscriber
    /// is expected in this crate (the work queue runner).
    fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>;
}

/// The typed client surface exposing `Update`/`UpdateStatus` on both kinds, plus
/// the finalizer helper. Status writes (`update_release_status`) and
/// spec/metadata writes (`update_release`) are modeled separately because the
/// phase machine treats them as distinct operations (see SPEC_FULL.md §4.6).
#[async_trait]
pub(crate) trait ControlPlaneClient: Send + Sync {
    /// Persists `phase`, `message` and `transition_time`.
    async fn update_release_status(&self, release: &ModuleRelease) -> anyhow::Result<()>;

    /// Persists `finalizers` and `labels`.
    async fn update_release(&self, release: &ModuleRelease) -> anyhow::Result<()>;

    /// Removes the release record entirely once cleanup has completed.
    async fn delete_release(&self, key: &str) -> anyhow::Result<()>;

    /// Ensures the named source carries the `release-exists` finalizer. Idempotent.
    async fn ensure_source_finalizer(&self, source_name: &str, token: &str) -> anyhow::Result<()>;

    /// Fetches a module source by name, creating a bare handle if unseen.
    async fn get_or_create_source(&self, source_name: &str) -> anyhow::Result<ModuleSource>;
}
