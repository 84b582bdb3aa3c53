// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-launch collaborator.
//!
//! Spawning real remote processes (rsh/ssh, a resource manager, ...) is
//! outside the core; the network only needs something that, given a launch
//! spec, brings up an endpoint which then connects back to its parent.
//! [`TaskLauncher`] is the in-process implementation used by tests, demos,
//! and single-host deployments: every "process" is a tokio task running a
//! [`crate::network::Network`] of the right role.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::filter::FilterLoader;
use crate::network::Network;
use crate::topology::{parse_spec, Rank};
use crate::transport::Transport;

/// Everything a launcher needs to bring up one endpoint.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub rank: Rank,
    pub host: String,
    /// Where the endpoint must connect back to.
    pub parent_host: String,
    pub parent_port: u16,
    /// The subtree rooted at this endpoint, in the textual topology grammar.
    /// A bare leaf means the endpoint is a back-end.
    pub subtree: String,
}

/// Spawn a remote endpoint given parent connection parameters. Reports
/// launch failure synchronously; whether the endpoint later attaches is
/// observed through the parent's attach timeout.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<()>;
}

/// The body a launched back-end runs once its network is up.
pub type BackendMain = Arc<dyn Fn(Network) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process launcher: internal nodes and back-ends become tokio tasks.
#[derive(Clone)]
pub struct TaskLauncher {
    transport: Arc<dyn Transport>,
    config: NetworkConfig,
    backend_main: BackendMain,
    filter_loader: Option<Arc<dyn FilterLoader>>,
}

impl TaskLauncher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: NetworkConfig,
        backend_main: BackendMain,
    ) -> Self {
        Self {
            transport,
            config,
            backend_main,
            filter_loader: None,
        }
    }

    /// Install a filter loader on every endpoint this launcher brings up, so
    /// flooded filter-load requests can be resolved tree-wide.
    pub fn with_filter_loader(mut self, loader: Arc<dyn FilterLoader>) -> Self {
        self.filter_loader = Some(loader);
        self
    }
}

#[async_trait]
impl ProcessLauncher for TaskLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<()> {
        let parsed = parse_spec(&spec.subtree)?;
        let launcher = self.clone();
        if parsed.is_leaf() {
            tokio::spawn(async move {
                match Network::back_end(
                    &spec.host,
                    spec.rank,
                    &spec.parent_host,
                    spec.parent_port,
                    launcher.transport.clone(),
                    launcher.filter_loader.clone(),
                    launcher.config.clone(),
                )
                .await
                {
                    Ok(net) => (launcher.backend_main)(net).await,
                    Err(e) => {
                        tracing::error!(rank = spec.rank, error = %e, "back-end failed to start")
                    }
                }
            });
        } else {
            tokio::spawn(async move {
                let child_launcher: Arc<dyn ProcessLauncher> = Arc::new(launcher.clone());
                match Network::internal(
                    &spec.subtree,
                    &spec.parent_host,
                    spec.parent_port,
                    launcher.transport.clone(),
                    child_launcher,
                    launcher.filter_loader.clone(),
                    launcher.config.clone(),
                )
                .await
                {
                    Ok(net) => net.wait_shutdown().await,
                    Err(e) => {
                        tracing::error!(rank = spec.rank, error = %e, "internal node failed to start")
                    }
                }
            });
        }
        Ok(())
    }
}
