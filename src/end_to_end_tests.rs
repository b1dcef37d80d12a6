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
//! Drives the full reconcile state machine (predictor, fs materializer, phase
//! transitions, debouncer) against an in-memory control plane and a real
//! temporary filesystem tree, without going through the work queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tempfile::TempDir;

use crate::config_service::ModuleSourceIndex;
use crate::controlplane::memory::InMemoryControlPlane;
use crate::controlplane::{ControlPlaneClient, ControlPlaneStore};
use crate::debouncer::RestartDebouncer;
use crate::domain::{ModuleRelease, Phase};
use crate::downloader::Downloader;
use crate::fs_materializer::FsMaterializer;
use crate::host_signal::HostSignal;
use crate::reconciler::{ModuleReconciler, Reconcile};

struct CountingSignal(Arc<AtomicUsize>);

impl HostSignal for CountingSignal {
    fn send(&self) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FixtureDownloader;

#[async_trait]
impl Downloader for FixtureDownloader {
    async fn download_by_module_version(&self, _source_name: &str, _module_name: &str, _version: &str) -> anyhow::Result<()> {
        anyhow::bail!("fixture downloader has no upstream to fetch from")
    }
}

/// A downloader that records how many times it was called and materializes the
/// payload directory it was asked to fetch, so preflight tests can distinguish
/// "downloader ran" from "payload happened to be there already".
struct RecordingDownloader {
    root: std::path::PathBuf,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Downloader for RecordingDownloader {
    async fn download_by_module_version(&self, _source_name: &str, module_name: &str, version: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(self.root.join(module_name).join(format!("v{version}"))).await?;
        Ok(())
    }
}

struct Fixture {
    _root: TempDir,
    control_plane: Arc<InMemoryControlPlane>,
    reconciler: ModuleReconciler,
    restart_count: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let materializer = FsMaterializer::new(root.path());
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let restart_count = Arc::new(AtomicUsize::new(0));
        let debouncer = RestartDebouncer::new(Arc::new(CountingSignal(restart_count.clone())));
        let reconciler = ModuleReconciler::new(
            control_plane.clone() as Arc<dyn ControlPlaneStore>,
            control_plane.clone() as Arc<dyn ControlPlaneClient>,
            materializer,
            debouncer,
            ModuleSourceIndex::new(),
        );
        Self {
            _root: root,
            control_plane,
            reconciler,
            restart_count,
        }
    }

    fn materializer(&self) -> FsMaterializer {
        FsMaterializer::new(self._root.path())
    }

    async fn make_payload(&self, module_name: &str, version: &Version) {
        tokio::fs::create_dir_all(self._root.path().join(module_name).join(format!("v{version}")))
            .await
            .unwrap();
    }

    async fn reconcile(&self, key: &str) {
        self.reconciler.reconcile(key).await.unwrap();
    }

    async fn get(&self, key: &str) -> ModuleRelease {
        self.control_plane.get_release(key).await.unwrap().expect("release must still exist")
    }
}

#[tokio::test]
async fn first_release_is_promoted_and_symlinked() {
    let fixture = Fixture::new();
    let version = Version::new(1, 0, 0);
    fixture.make_payload("mod-a", &version).await;

    let release = ModuleRelease::new("mod-a", version.clone(), 10, "S1");
    let key = release.key();
    fixture.control_plane.create_release(release).await;

    fixture.reconcile(&key).await; // None -> Pending
    assert_eq!(fixture.get(&key).await.phase, Phase::Pending);

    fixture.reconcile(&key).await; // Pending -> Deployed
    let deployed = fixture.get(&key).await;
    assert_eq!(deployed.phase, Phase::Deployed);
    assert!(deployed.has_finalizer("fs-exists"));

    let symlink = fixture.materializer().find_current_symlink("mod-a").await;
    assert_eq!(symlink, Some(fixture.materializer().symlinks_dir().join("10-mod-a")));
    let target = tokio::fs::read_link(symlink.unwrap()).await.unwrap();
    assert_eq!(target, std::path::PathBuf::from("../mod-a/v1.0.0"));
    assert_eq!(fixture.restart_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn patch_overtake_supersedes_previous_deployment_and_skips_intermediate() {
    let fixture = Fixture::new();
    let v1 = Version::new(1, 0, 0);
    let v2 = Version::new(1, 0, 1);
    let v3 = Version::new(1, 0, 2);
    fixture.make_payload("mod-a", &v1).await;
    fixture.make_payload("mod-a", &v3).await;

    let first = ModuleRelease::new("mod-a", v1.clone(), 10, "S1");
    let first_key = first.key();
    fixture.control_plane.create_release(first).await;
    fixture.reconcile(&first_key).await;
    fixture.reconcile(&first_key).await;
    assert_eq!(fixture.get(&first_key).await.phase, Phase::Deployed);

    let skipped = ModuleRelease::new("mod-a", v2.clone(), 10, "S1");
    let skipped_key = skipped.key();
    fixture.control_plane.create_release(skipped).await;
    fixture.reconcile(&skipped_key).await;

    let newest = ModuleRelease::new("mod-a", v3.clone(), 10, "S1");
    let newest_key = newest.key();
    fixture.control_plane.create_release(newest).await;
    fixture.reconcile(&newest_key).await; // None -> Pending
    fixture.reconcile(&newest_key).await; // Pending -> converge for the whole module

    assert_eq!(fixture.get(&first_key).await.phase, Phase::Superseded);
    assert_eq!(fixture.get(&skipped_key).await.phase, Phase::Superseded);
    assert_eq!(fixture.get(&newest_key).await.phase, Phase::Deployed);

    let symlink = fixture.materializer().find_current_symlink("mod-a").await.unwrap();
    let target = tokio::fs::read_link(&symlink).await.unwrap();
    assert_eq!(target, std::path::PathBuf::from("../mod-a/v1.0.2"));
}

/// Property test over randomly generated release sequences: after every release
/// of a module has been observed and reconciled, exactly one ends up Deployed
/// (P1), it is always the highest version seen, every older release is
/// Superseded (P1), and the module's symlink resolves to that release's payload
/// (P2).
#[tokio::test]
async fn property_random_release_sequences_converge_to_single_deployed_with_agreeing_symlink() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for trial in 0..30 {
        let fixture = Fixture::new();
        let module_name = format!("mod-prop-{trial}");
        let weight = rng.gen_range(1..100);

        let length = rng.gen_range(1..=6);
        let mut version = Version::new(1, 0, 0);
        let mut keys = Vec::with_capacity(length);
        for _ in 0..length {
            if rng.gen_bool(0.3) {
                version.minor += 1;
                version.patch = 0;
            } else {
                version.patch += 1;
            }
            fixture.make_payload(&module_name, &version).await;

            let release = ModuleRelease::new(module_name.as_str(), version.clone(), weight, "S1");
            let key = release.key();
            fixture.control_plane.create_release(release).await;
            fixture.reconcile(&key).await; // None -> Pending
            fixture.reconcile(&key).await; // Pending -> converge the whole module
            keys.push((key, version.clone()));
        }

        let (_, highest_version) = keys.last().unwrap().clone();
        let mut deployed_count = 0;
        for (key, version) in &keys {
            let release = fixture.get(key).await;
            if *version == highest_version {
                assert_eq!(release.phase, Phase::Deployed, "trial {trial}: latest version must be Deployed");
                deployed_count += 1;
            } else {
                assert_eq!(release.phase, Phase::Superseded, "trial {trial}: older version must be Superseded");
            }
        }
        assert_eq!(deployed_count, 1, "trial {trial}: exactly one release must be Deployed");

        let symlink = fixture
            .materializer()
            .find_current_symlink(&module_name)
            .await
            .unwrap_or_else(|| panic!("trial {trial}: symlink must exist for {module_name}"));
        let target = tokio::fs::read_link(&symlink).await.unwrap();
        assert_eq!(
            target,
            std::path::PathBuf::from(format!("../{module_name}/v{highest_version}")),
            "trial {trial}: symlink must agree with the Deployed release"
        );
    }
}

#[tokio::test]
async fn missing_payload_suspends_instead_of_promoting() {
    let fixture = Fixture::new();
    let version = Version::new(1, 0, 0);
    // deliberately no payload directory created

    let release = ModuleRelease::new("mod-a", version, 10, "S1");
    let key = release.key();
    fixture.control_plane.create_release(release).await;

    fixture.reconcile(&key).await; // None -> Pending
    fixture.reconcile(&key).await; // Pending -> attempted promotion, fails

    let suspended = fixture.get(&key).await;
    assert_eq!(suspended.phase, Phase::Suspended);
    assert!(!suspended.message.is_empty());
    assert_eq!(fixture.restart_count.load(Ordering::SeqCst), 0, "a suspended release must not trigger a restart");
}

#[tokio::test]
async fn deletion_of_a_deployed_release_purges_payload_and_symlink() {
    let fixture = Fixture::new();
    let version = Version::new(1, 0, 0);
    fixture.make_payload("mod-a", &version).await;

    let release = ModuleRelease::new("mod-a", version.clone(), 10, "S1");
    let key = release.key();
    fixture.control_plane.create_release(release).await;
    fixture.reconcile(&key).await;
    fixture.reconcile(&key).await;
    assert_eq!(fixture.get(&key).await.phase, Phase::Deployed);

    fixture.control_plane.mark_for_deletion(&key, std::time::SystemTime::now()).await.unwrap();
    fixture.reconcile(&key).await;

    assert!(fixture.control_plane.get_release(&key).await.unwrap().is_none());
    assert!(fixture.materializer().find_current_symlink("mod-a").await.is_none());
    assert!(!fixture.materializer().payload_exists_sync("mod-a", &version));
}

#[tokio::test]
async fn preflight_restores_a_missing_symlink_for_a_deployed_release_whose_payload_exists() {
    let root = tempfile::tempdir().unwrap();
    let materializer = FsMaterializer::new(root.path());
    let version = Version::new(1, 0, 0);
    tokio::fs::create_dir_all(root.path().join("mod-a").join(format!("v{version}"))).await.unwrap();

    let control_plane = InMemoryControlPlane::new();
    let mut release = ModuleRelease::new("mod-a", version, 10, "S1");
    release.set_phase(Phase::Deployed);
    control_plane.create_release(release).await;

    // The symlink is what's missing here, not the payload, but §4.7's trigger is
    // symlink absence alone: the downloader must still be invoked once.
    let calls = Arc::new(AtomicUsize::new(0));
    let downloader = RecordingDownloader {
        root: root.path().to_path_buf(),
        calls: calls.clone(),
    };
    let module_source_index = ModuleSourceIndex::new();
    crate::preflight::run(&control_plane, &materializer, &downloader, &module_source_index)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "downloader must run whenever the symlink is absent");
    let symlink = materializer.find_current_symlink("mod-a").await;
    assert_eq!(symlink, Some(materializer.symlinks_dir().join("10-mod-a")));
    assert_eq!(module_source_index.source_of("mod-a").await, Some("S1".to_string()));
}

#[tokio::test]
async fn preflight_downloads_and_restores_when_both_symlink_and_payload_are_missing() {
    let root = tempfile::tempdir().unwrap();
    let materializer = FsMaterializer::new(root.path());
    let version = Version::new(3, 1, 0);
    // deliberately no payload directory created up front

    let control_plane = InMemoryControlPlane::new();
    let mut release = ModuleRelease::new("mod-c", version, 5, "S1");
    release.set_phase(Phase::Deployed);
    control_plane.create_release(release).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let downloader = RecordingDownloader {
        root: root.path().to_path_buf(),
        calls: calls.clone(),
    };
    let module_source_index = ModuleSourceIndex::new();
    crate::preflight::run(&control_plane, &materializer, &downloader, &module_source_index)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(materializer.payload_exists_sync("mod-c", &Version::new(3, 1, 0)));
    let symlink = materializer.find_current_symlink("mod-c").await;
    assert_eq!(symlink, Some(materializer.symlinks_dir().join("5-mod-c")));
}

#[tokio::test]
async fn preflight_purges_an_orphaned_symlink_with_no_matching_release() {
    let root = tempfile::tempdir().unwrap();
    let materializer = FsMaterializer::new(root.path());
    let version = Version::new(1, 0, 0);
    tokio::fs::create_dir_all(root.path().join("mod-orphan").join(format!("v{version}"))).await.unwrap();
    let symlinks_dir = root.path().join("modules");
    tokio::fs::create_dir_all(&symlinks_dir).await.unwrap();
    symlink::symlink_dir("../mod-orphan/v1.0.0", symlinks_dir.join("10-mod-orphan")).unwrap();

    let control_plane = InMemoryControlPlane::new();
    let module_source_index = ModuleSourceIndex::new();
    crate::preflight::run(&control_plane, &materializer, &FixtureDownloader, &module_source_index)
        .await
        .unwrap();

    assert!(materializer.find_current_symlink("mod-orphan").await.is_none());
}
