// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Arbor: multicast/reduction middleware over a tree overlay of processes.
//!
//! A tree of endpoints is instantiated from a textual topology
//! specification: one front-end at the root, internal routing nodes in the
//! middle, back-end leaves at the bottom. Applications communicate on
//! [`Stream`]s bound to a subset of back-ends: packets sent at the front-end
//! are multicast down to the stream's members, packets sent at back-ends are
//! aggregated upward through per-stream [`filter`]s under a configurable
//! synchronization policy.
//!
//! The tree self-repairs: when an internal node dies, its orphaned subtrees
//! pick new parents through a scored adoption algorithm and splice
//! themselves back in, while reduction wait sets shrink immediately so
//! in-flight rounds complete with the survivors.
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor_net::{
//!     BackendMain, DuplexTransport, Network, NetworkConfig, SyncPolicy, TaskLauncher, Value,
//! };
//! use arbor_net::filter::FILTER_INT_SUM;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport = Arc::new(DuplexTransport::new());
//! let backend_main: BackendMain =
//!     Arc::new(|net| Box::pin(async move { net.wait_shutdown().await }));
//! let launcher = Arc::new(TaskLauncher::new(
//!     transport.clone(),
//!     NetworkConfig::default(),
//!     backend_main,
//! ));
//! let net = Network::front_end(
//!     "fe:5000:0:=>(be:0:1,be:0:2)",
//!     transport,
//!     launcher,
//!     NetworkConfig::default(),
//! )
//! .await?;
//! let stream = net
//!     .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, 1)
//!     .await?;
//! stream.send(100, "%d", &[Value::Int32(0)]).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod launch;
pub mod logging;
pub mod network;
pub mod packet;
pub mod stream;
pub mod topology;
pub mod transport;

pub use config::{AdoptionPolicy, NetworkConfig};
pub use error::{error_kind, ErrorKind, NetError, RecvOutcome};
pub use events::TopologyEvent;
pub use filter::{Filter, FilterContext, FilterLoader, FilterOutput, FilterRegistry};
pub use launch::{BackendMain, LaunchSpec, ProcessLauncher, TaskLauncher};
pub use network::{Network, NetworkRecv};
pub use packet::{Packet, Value};
pub use stream::{Stream, SyncPolicy};
pub use topology::{FanoutStats, Rank, Topology};
pub use transport::{DuplexTransport, TcpTransport, Transport};
