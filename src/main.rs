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
use std::process::exit;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::config::{CommandLineOptions, ReconcilerConfig};
use crate::config_service::ModuleSourceIndex;
use crate::controlplane::memory::InMemoryControlPlane;
use crate::controlplane::{ControlPlaneClient, ControlPlaneStore};
use crate::debouncer::RestartDebouncer;
use crate::downloader::{Downloader, UnconfiguredDownloader};
use crate::fs_materializer::FsMaterializer;
use crate::host_signal::Sigusr2Signal;
use crate::queue::WorkQueue;
use crate::reconciler::{ModuleReconciler, Reconcile};

mod config;
mod config_service;
mod controlplane;
mod debouncer;
mod doc_publisher;
mod domain;
mod downloader;
mod fs_materializer;
mod host_signal;
mod predictor;
mod preflight;
mod queue;
mod reconciler;

#[cfg(test)]
mod end_to_end_tests;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .try_init()
        .context("unable to initialize logging")?;
    info!("Running module-reconciler version {}", VERSION);

    let command_line_options = CommandLineOptions::parse();
    let Some(external_modules_dir) = command_line_options.external_modules_dir else {
        info!("EXTERNAL_MODULES_DIR is not set, nothing to reconcile, exiting");
        return Ok(());
    };

    let reconciler_config = match &command_line_options.config_path {
        Some(path) => {
            info!("Loading tuning configuration from {}...", path.display());
            let config = ReconcilerConfig::load_from_file(path)
                .await
                .context("couldn't parse tuning configuration file")?;
            config.validate().context("issue detected while validating tuning configuration")?;
            config
        }
        None => ReconcilerConfig::default(),
    };

    let materializer = FsMaterializer::new(external_modules_dir);
    let module_source_index = ModuleSourceIndex::new();
    let control_plane = Arc::new(InMemoryControlPlane::new());
    let downloader: Arc<dyn Downloader> = Arc::new(UnconfiguredDownloader);

    info!("Running preflight synchronization...");
    preflight::run(
        control_plane.as_ref() as &dyn ControlPlaneStore,
        &materializer,
        downloader.as_ref(),
        &module_source_index,
    )
    .await
    .context("preflight synchronization failed")?;

    let cancellation = CancellationToken::new();
    let debouncer = RestartDebouncer::new(Arc::new(Sigusr2Signal));
    let debouncer_handle = tokio::spawn({
        let debouncer = debouncer.clone();
        let cancellation = cancellation.clone();
        async move { debouncer.run(cancellation).await }
    });

    let reconciler: Arc<dyn Reconcile> = Arc::new(ModuleReconciler::new(
        control_plane.clone() as Arc<dyn ControlPlaneStore>,
        control_plane.clone() as Arc<dyn ControlPlaneClient>,
        materializer,
        debouncer,
        module_source_index,
    ));

    let queue = Arc::new(WorkQueue::new(reconciler_config.to_queue_config()));
    queue::runner::subscribe_to_control_plane(
        control_plane.clone() as Arc<dyn ControlPlaneStore>,
        queue.clone(),
        cancellation.clone(),
    );
    let worker_handles = queue::runner::run_workers(command_line_options.workers, queue.clone(), reconciler, cancellation.clone());

    info!("Reconciler running with {} worker(s)", command_line_options.workers);
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Quit signal received, shutting down...");

    cancellation.cancel();
    queue.shutdown().await;
    for handle in worker_handles {
        if let Err(err) = handle.await {
            error!("worker task panicked: {err}");
        }
    }
    debouncer_handle.await.context("debouncer task panicked")?;

    exit(0)
}
