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
use crate::domain::{ModuleRelease, Phase};

/// The outcome of a predictor pass over one module's releases, sorted ascending by version.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PredictorResult {
    /// Index of the presently Deployed release, if any.
    pub current_index: Option<usize>,
    /// Index of the release that should become Deployed this pass, if any.
    pub desired_index: Option<usize>,
    /// Indices of Pending releases bypassed as patch-level jumps; these must be
    /// marked Superseded.
    pub skipped_patches: Vec<usize>,
}

/// Picks the desired release to promote among a module's releases, already sorted
/// ascending by version. `may_promote` is the injectable update-window/approval gate;
/// the default policy always returns `true` (always promote the highest eligible version).
pub(crate) fn predict(releases: &[ModuleRelease], may_promote: &dyn Fn(&ModuleRelease) -> bool) -> PredictorResult {
    let current_index = releases.iter().position(|release| release.phase == Phase::Deployed);
    let current_version = current_index.map(|index| releases[index].version.clone());

    let desired_index = releases
        .iter()
        .enumerate()
        .rev()
        .find(|(_, release)| {
            release.phase == Phase::Pending
                && may_promote(release)
                && current_version.as_ref().map(|current| release.version > *current).unwrap_or(true)
        })
        .map(|(index, _)| index);

    let skipped_patches = match desired_index {
        Some(desired) => releases
            .iter()
            .enumerate()
            .skip(current_index.map(|index| index + 1).unwrap_or(0))
            .take(desired.saturating_sub(current_index.map(|index| index + 1).unwrap_or(0)))
            .filter(|(_, release)| release.phase == Phase::Pending)
            .map(|(index, _)| index)
            .collect(),
        None => Vec::new(),
    };

    PredictorResult {
        current_index,
        desired_index,
        skipped_patches,
    }
}

/// The default promotion policy: always allow promoting the highest eligible version.
pub(crate) fn always_promote(_release: &ModuleRelease) -> bool {
    true
}
