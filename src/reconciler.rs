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
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::config_service::ModuleSourceIndex;
use crate::controlplane::{ControlPlaneClient, ControlPlaneStore};
use crate::debouncer::RestartDebouncer;
use crate::doc_publisher::publish_documentation;
use crate::domain::{ModuleRelease, Phase, FINALIZER_FS_EXISTS, FINALIZER_RELEASE_EXISTS, LABEL_STATUS};
use crate::fs_materializer::{FsMaterializer, MaterializeError};
use crate::predictor::{always_promote, predict};

/// What the work queue runner should do after a reconcile pass.
#[derive(Debug)]
pub(crate) enum ReconcileOutcome {
    /// Converged; forget the item and reset its back-off.
    Success,
    /// Re-add after a fixed delay.
    RequeueAfter(Duration),
    /// Re-add with rate-limited back-off.
    Requeue,
}

/// The entry point the work queue runner drives for every dequeued key.
#[async_trait]
pub(crate) trait Reconcile: Send + Sync {
    async fn reconcile(&self, release_key: &str) -> anyhow::Result<ReconcileOutcome>;
}

/// Orchestrates the FS materializer, predictor, phase machine and debouncer for
/// a single module, triggered per-key by the work queue runner.
pub(crate) struct ModuleReconciler {
    store: Arc<dyn ControlPlaneStore>,
    client: Arc<dyn ControlPlaneClient>,
    materializer: FsMaterializer,
    debouncer: RestartDebouncer,
    module_source_index: ModuleSourceIndex,
}

impl ModuleReconciler {
    pub(crate) fn new(
        store: Arc<dyn ControlPlaneStore>,
        client: Arc<dyn ControlPlaneClient>,
        materializer: FsMaterializer,
        debouncer: RestartDebouncer,
        module_source_index: ModuleSourceIndex,
    ) -> Self {
        Self {
            store,
            client,
            materializer,
            debouncer,
            module_source_index,
        }
    }

    async fn delete_branch(&self, release: &ModuleRelease) -> anyhow::Result<ReconcileOutcome> {
        self.materializer.purge_payload(&release.module_name, &release.version).await?;

        if release.phase == Phase::Deployed {
            if let Some(symlink) = self.materializer.find_current_symlink(&release.module_name).await {
                self.materializer.disable(&symlink).await;
            }
        }

        if release.has_finalizer(FINALIZER_FS_EXISTS) {
            let mut updated = release.clone();
            updated.remove_finalizer(FINALIZER_FS_EXISTS);
            self.client.update_release(&updated).await?;
        }

        self.client.delete_release(&release.key()).await?;
        Ok(ReconcileOutcome::Success)
    }

    async fn ensure_deployed_invariants(&self, release: &ModuleRelease) -> anyhow::Result<ReconcileOutcome> {
        let mut updated = release.clone();
        let mut changed = updated.add_finalizer(FINALIZER_FS_EXISTS);
        if updated.labels.get(LABEL_STATUS).map(String::as_str) != Some(Phase::Deployed.label_value()) {
            updated.labels.insert(LABEL_STATUS.to_string(), Phase::Deployed.label_value().to_string());
            changed = true;
        }
        if changed {
            self.client.update_release(&updated).await?;
        }
        self.client.ensure_source_finalizer(&release.module_source, FINALIZER_RELEASE_EXISTS).await?;
        self.module_source_index
            .add_module_name_to_source(&release.module_name, &release.module_source)
            .await;
        Ok(ReconcileOutcome::Success)
    }

    async fn ensure_status_label(&self, release: &ModuleRelease) -> anyhow::Result<ReconcileOutcome> {
        let expected = release.phase.label_value();
        if release.labels.get(LABEL_STATUS).map(String::as_str) != Some(expected) {
            let mut updated = release.clone();
            updated.labels.insert(LABEL_STATUS.to_string(), expected.to_string());
            self.client.update_release(&updated).await?;
        }
        Ok(ReconcileOutcome::Success)
    }

    /// §4.6.1: convergence for a single Pending release, run against every
    /// sibling of its module.
    async fn converge_pending(&self, release: &ModuleRelease) -> anyhow::Result<ReconcileOutcome> {
        let mut siblings = self.store.list_releases_for_module(&release.module_name).await?;
        siblings.sort_by(|left, right| left.version.cmp(&right.version));

        let prediction = predict(&siblings, &always_promote);
        let current_symlink = self.materializer.find_current_symlink(&release.module_name).await;
        let mut restart_reason: Option<&'static str> = None;

        // Already-latest case: restore the symlink if it drifted, before anything else.
        if prediction.desired_index.is_none() {
            if let Some(current_index) = prediction.current_index {
                let current = &siblings[current_index];
                let relative_target = current.relative_target();
                let linked = match &current_symlink {
                    Some(path) => self.materializer.is_payload_linked(path, &relative_target).await,
                    None => false,
                };
                if !linked {
                    let new_symlink = current_symlink
                        .clone()
                        .unwrap_or_else(|| self.materializer.release_symlink(&current.symlink_name()));
                    match self
                        .materializer
                        .enable(current_symlink.as_deref(), &new_symlink, &relative_target)
                        .await
                    {
                        Ok(()) => restart_reason = Some("one of modules is not enabled"),
                        Err(err) => {
                            self.suspend(current, &err).await?;
                            return Ok(ReconcileOutcome::Requeue);
                        }
                    }
                }
            }
        }

        // Demote skipped patches before promoting anything.
        for &index in &prediction.skipped_patches {
            let mut superseded = siblings[index].clone();
            superseded.set_phase(Phase::Superseded);
            superseded.message.clear();
            self.client.update_release_status(&superseded).await?;
            self.client.update_release(&superseded).await?;
        }

        // Demote the old current before promoting the new desired (invariant 4).
        if let Some(current_index) = prediction.current_index {
            if prediction.desired_index.is_some() {
                let mut superseded = siblings[current_index].clone();
                superseded.set_phase(Phase::Superseded);
                superseded.message.clear();
                self.client.update_release_status(&superseded).await?;
                self.client.update_release(&superseded).await?;
            }
        }

        if let Some(desired_index) = prediction.desired_index {
            let desired = &siblings[desired_index];
            let relative_target = desired.relative_target();
            let new_symlink = current_symlink
                .clone()
                .unwrap_or_else(|| self.materializer.release_symlink(&desired.symlink_name()));

            match self
                .materializer
                .enable(current_symlink.as_deref(), &new_symlink, &relative_target)
                .await
            {
                Ok(()) => {
                    let mut deployed = desired.clone();
                    deployed.set_phase(Phase::Deployed);
                    deployed.message.clear();
                    self.client.update_release_status(&deployed).await?;

                    deployed.add_finalizer(FINALIZER_FS_EXISTS);
                    self.client.update_release(&deployed).await?;
                    self.client
                        .ensure_source_finalizer(&deployed.module_source, FINALIZER_RELEASE_EXISTS)
                        .await?;
                    self.module_source_index
                        .add_module_name_to_source(&deployed.module_name, &deployed.module_source)
                        .await;

                    publish_documentation(self.materializer.root().join(&deployed.module_name).as_path());
                    restart_reason = Some("a new module release found");
                }
                Err(err) => {
                    self.suspend(desired, &err).await?;
                    return Ok(ReconcileOutcome::Requeue);
                }
            }
        }

        if let Some(reason) = restart_reason {
            self.debouncer.emit_restart(reason).await;
        }
        Ok(ReconcileOutcome::Success)
    }

    async fn suspend(&self, release: &ModuleRelease, err: &MaterializeError) -> anyhow::Result<()> {
        let mut suspended = release.clone();
        suspended.set_phase(Phase::Suspended);
        suspended.message = format!("Desired version of the module met problems: {err}");
        self.client.update_release_status(&suspended).await
    }
}

#[async_trait]
impl Reconcile for ModuleReconciler {
    async fn reconcile(&self, release_key: &str) -> anyhow::Result<ReconcileOutcome> {
        let release = match self.store.get_release(release_key).await? {
            Some(release) => release,
            None => return Ok(ReconcileOutcome::Success),
        };

        if release.deletion_timestamp.is_some() {
            return self.delete_branch(&release).await;
        }

        match release.phase {
            Phase::None => {
                let mut pending = release.clone();
                pending.set_phase(Phase::Pending);
                self.client.update_release_status(&pending).await?;
                Ok(ReconcileOutcome::Success)
            }
            Phase::Superseded | Phase::Suspended => self.ensure_status_label(&release).await,
            Phase::Deployed => self.ensure_deployed_invariants(&release).await,
            Phase::Pending => {
                info!("converging pending release {release_key}");
                match self.converge_pending(&release).await {
                    Ok(outcome) => Ok(outcome),
                    Err(err) => {
                        warn!("reconcile of {release_key} failed: {err:?}");
                        Err(err)
                    }
                }
            }
        }
    }
}
