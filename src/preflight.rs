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
use std::collections::HashSet;

use futures::stream::{FuturesUnordered, StreamExt as FuturesStreamExt};
use log::{info, warn};
use tokio::fs::read_dir;
use tokio_stream::wrappers::ReadDirStream;

use crate::config_service::ModuleSourceIndex;
use crate::controlplane::ControlPlaneStore;
use crate::domain::Phase;
use crate::downloader::Downloader;
use crate::fs_materializer::FsMaterializer;

/// Runs once at startup, before the work queue and its workers are spawned.
/// Pass 1 restores the enable symlink for every Deployed release whose payload
/// or symlink went missing since the process last ran; pass 2 purges any
/// `modules/` entry that no longer corresponds to a known release. Both passes
/// also rebuild `module_source_index` from scratch.
pub(crate) async fn run(
    store: &dyn ControlPlaneStore,
    materializer: &FsMaterializer,
    downloader: &dyn Downloader,
    module_source_index: &ModuleSourceIndex,
) -> anyhow::Result<()> {
    let releases = store.list_all_releases().await?;
    let deployed: Vec<_> = releases.iter().filter(|release| release.phase == Phase::Deployed).collect();

    info!("preflight: restoring {} deployed release(s)", deployed.len());
    let mut restores = deployed
        .iter()
        .map(|release| async move {
            module_source_index
                .add_module_name_to_source(&release.module_name, &release.module_source)
                .await;

            let existing_symlink = materializer.find_current_symlink(&release.module_name).await;
            if existing_symlink.is_none() {
                if let Err(err) = downloader
                    .download_by_module_version(&release.module_source, &release.module_name, &release.version.to_string())
                    .await
                {
                    warn!("preflight: failed to restore payload for {}: {err:?}", release.key());
                    return;
                }
            }

            let relative_target = release.relative_target();
            let symlink = existing_symlink.unwrap_or_else(|| materializer.release_symlink(&release.symlink_name()));

            if !materializer.is_payload_linked(&symlink, &relative_target).await {
                if let Err(err) = materializer.enable(Some(&symlink), &symlink, &relative_target).await {
                    warn!("preflight: failed to restore symlink for {}: {err}", release.key());
                }
            }
        })
        .collect::<FuturesUnordered<_>>();
    while FuturesStreamExt::next(&mut restores).await.is_some() {}

    let known_module_names: HashSet<&str> = releases.iter().map(|release| release.module_name.as_str()).collect();
    purge_orphan_symlinks(materializer, &known_module_names).await?;

    Ok(())
}

async fn purge_orphan_symlinks(materializer: &FsMaterializer, known_module_names: &HashSet<&str>) -> anyhow::Result<()> {
    let symlinks_dir = materializer.root().join("modules");
    let directory_content = match read_dir(&symlinks_dir).await {
        Ok(directory_content) => directory_content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let weight_prefix = regex::Regex::new(r"^[0-9]+-").expect("static pattern is valid");
    let mut entries = ReadDirStream::new(directory_content);
    while let Some(entry) = tokio_stream::StreamExt::next(&mut entries).await {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let module_name = weight_prefix.replace(&file_name, "");
        if !known_module_names.contains(module_name.as_ref()) {
            info!("preflight: purging orphan symlink {file_name}");
            materializer.disable(&entry.path()).await;
        }
    }
    Ok(())
}
