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
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;

use super::{ChangeEvent, ControlPlaneClient, ControlPlaneStore};
use crate::domain::{ModuleRelease, ModuleSource};

/// An in-memory control plane used to run the reconciler standalone and to
/// drive tests. Mutating calls (`create_release`, `update_release`, ...) bump
/// `resource_version` and fan the change out to every live subscriber.
pub(crate) struct InMemoryControlPlane {
    releases: RwLock<HashMap<String, ModuleRelease>>,
    sources: RwLock<HashMap<String, ModuleSource>>,
    subscribers: StdMutex<Vec<UnboundedSender<ChangeEvent>>>,
}

impl InMemoryControlPlane {
    pub(crate) fn new() -> Self {
        Self {
            releases: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            subscribers: StdMutex::new(Vec::new()),
        }
    }

    fn broadcast(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber registry poisoned");
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Inserts a brand-new release in phase `None` and announces it as `Added`.
    pub(crate) async fn create_release(&self, release: ModuleRelease) {
        let key = release.key();
        self.releases.write().await.insert(key, release.clone());
        self.broadcast(ChangeEvent::Added(release));
    }

    /// Re-delivers every currently known release as an `Updated` event with its
    /// current (unchanged) `resource_version`, emulating the informer's periodic
    /// relist. Subscribers that compare resource versions treat these as no-ops.
    pub(crate) async fn resync(&self) {
        let releases: Vec<ModuleRelease> = self.releases.read().await.values().cloned().collect();
        for release in releases {
            self.broadcast(ChangeEvent::Updated(release));
        }
    }

    /// Sets `deletion_timestamp` on the named release and announces the change.
    pub(crate) async fn mark_for_deletion(&self, key: &str, now: std::time::SystemTime) -> anyhow::Result<()> {
        let mut releases = self.releases.write().await;
        let release = releases
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("release {key} not found"))?;
        release.deletion_timestamp = Some(now);
        release.resource_version += 1;
        let snapshot = release.clone();
        drop(releases);
        self.broadcast(ChangeEvent::Updated(snapshot));
        Ok(())
    }
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlaneStore for InMemoryControlPlane {
    async fn get_release(&self, key: &str) -> anyhow::Result<Option<ModuleRelease>> {
        Ok(self.releases.read().await.get(key).cloned())
    }

    async fn list_releases_for_module(&self, module_name: &str) -> anyhow::Result<Vec<ModuleRelease>> {
        let mut releases: Vec<ModuleRelease> = self
            .releases
            .read()
            .await
            .values()
            .filter(|release| release.module_name == module_name)
            .cloned()
            .collect();
        releases.sort_by(|left, right| left.version.cmp(&right.version));
        Ok(releases)
    }

    async fn list_all_releases(&self) -> anyhow::Result<Vec<ModuleRelease>> {
        Ok(self.releases.read().await.values().cloned().collect())
    }

    fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("subscriber registry poisoned").push(sender);
        receiver
    }
}

#[async_trait]
impl ControlPlaneClient for InMemoryControlPlane {
    async fn update_release_status(&self, release: &ModuleRelease) -> anyhow::Result<()> {
        let mut releases = self.releases.write().await;
        let stored = releases
            .get_mut(&release.key())
            .ok_or_else(|| anyhow::anyhow!("release {} not found", release.key()))?;
        stored.phase = release.phase;
        stored.message = release.message.clone();
        stored.transition_time = release.transition_time;
        stored.resource_version += 1;
        let snapshot = stored.clone();
        drop(releases);
        self.broadcast(ChangeEvent::Updated(snapshot));
        Ok(())
    }

    async fn update_release(&self, release: &ModuleRelease) -> anyhow::Result<()> {
        let mut releases = self.releases.write().await;
        let stored = releases
            .get_mut(&release.key())
            .ok_or_else(|| anyhow::anyhow!("release {} not found", release.key()))?;
        stored.finalizers = release.finalizers.clone();
        stored.labels = release.labels.clone();
        stored.resource_version += 1;
        let snapshot = stored.clone();
        drop(releases);
        self.broadcast(ChangeEvent::Updated(snapshot));
        Ok(())
    }

    async fn delete_release(&self, key: &str) -> anyhow::Result<()> {
        let mut releases = self.releases.write().await;
        if let Some(release) = releases.remove(key) {
            drop(releases);
            self.broadcast(ChangeEvent::Deleted(release));
        }
        Ok(())
    }

    async fn ensure_source_finalizer(&self, source_name: &str, token: &str) -> anyhow::Result<()> {
        let mut sources = self.sources.write().await;
        let source = sources
            .entry(source_name.to_string())
            .or_insert_with(|| ModuleSource::new(source_name));
        source.finalizers.insert(token.to_string());
        Ok(())
    }

    async fn get_or_create_source(&self, source_name: &str) -> anyhow::Result<ModuleSource> {
        let mut sources = self.sources.write().await;
        let source = sources
            .entry(source_name.to_string())
            .or_insert_with(|| ModuleSource::new(source_name));
        Ok(source.clone())
    }
}
