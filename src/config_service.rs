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
use std::sync::Arc;

use tokio::sync::RwLock;

/// The `moduleName -> sourceName` index consulted by neighbouring subsystems.
/// Written only from the reconciler (serialized per module by the work queue)
/// and from preflight (before workers start), so no lock is strictly required
/// for writers; readers from other subsystems still go through the read guard
/// since they have no such serialization guarantee of their own.
#[derive(Clone, Default)]
pub(crate) struct ModuleSourceIndex {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ModuleSourceIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that `module_name` is produced by `source_name`. Idempotent.
    pub(crate) async fn add_module_name_to_source(&self, module_name: &str, source_name: &str) {
        self.inner.write().await.insert(module_name.to_string(), source_name.to_string());
    }

    pub(crate) async fn source_of(&self, module_name: &str) -> Option<String> {
        self.inner.read().await.get(module_name).cloned()
    }

    /// A point-in-time copy for readers that cannot hold the lock across `await`.
    pub(crate) async fn snapshot(&self) -> HashMap<String, String> {
        self.inner.read().await.clone()
    }
}
