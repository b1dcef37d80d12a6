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
use async_trait::async_trait;

/// The OCI downloader that fetches a module's payload given its source and
/// version, consumed only by the preflight synchronizer. This is an external
/// collaborator referenced only by interface; the mirroring tooling that moves
/// OCI layouts between registries and the registry client itself live outside
/// this crate.
#[async_trait]
pub(crate) trait Downloader: Send + Sync {
    /// Fetches the payload for `module_name` at `version` from `source_name`
    /// into the downloader's configured root, so that afterwards
    /// `ROOT/<module_name>/v<version>` exists on disk.
    async fn download_by_module_version(&self, source_name: &str, module_name: &str, version: &str) -> anyhow::Result<()>;
}

/// A downloader with nowhere to fetch from. Exists so the binary can run with
/// zero external wiring; any deployment that wants preflight restoration to
/// actually succeed must supply a real implementation of [`Downloader`].
pub(crate) struct UnconfiguredDownloader;

#[async_trait]
impl Downloader for UnconfiguredDownloader {
    async fn download_by_module_version(&self, source_name: &str, module_name: &str, version: &str) -> anyhow::Result<()> {
        anyhow::bail!(
            "no downloader configured: cannot fetch {module_name}@{version} from {source_name}"
        )
    }
}
