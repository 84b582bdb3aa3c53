// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One front-end, two internal routers, four back-ends, all in-process over
//! the in-memory transport. The front-end multicasts a request; every
//! back-end answers with its rank and the tree sums the answers on the way
//! up.
//!
//! Run with: `cargo run --example sum_reduction`

use std::sync::Arc;

use anyhow::Result;
use arbor_net::filter::{FILTER_IDENTITY, FILTER_INT_SUM};
use arbor_net::{
    BackendMain, DuplexTransport, Network, NetworkConfig, NetworkRecv, RecvOutcome, SyncPolicy,
    TaskLauncher, Value,
};

const TOPOLOGY: &str = "fe:5000:0:=>(cp:5001:1:=>(be:0:3,be:0:4),cp:5002:2:=>(be:0:5,be:0:6))";
const TAG_REPORT: i32 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    arbor_net::logging::init();

    let transport = Arc::new(DuplexTransport::new());
    let backend_main: BackendMain = Arc::new(|net| Box::pin(backend_main(net)));
    let launcher = Arc::new(TaskLauncher::new(
        transport.clone(),
        NetworkConfig::default(),
        backend_main,
    ));

    let net = Network::front_end(TOPOLOGY, transport, launcher, NetworkConfig::default()).await?;
    let stream = net
        .new_stream(&[], FILTER_INT_SUM, SyncPolicy::WaitForAll, FILTER_IDENTITY)
        .await?;

    stream.send(TAG_REPORT, "%d", &[Value::Int32(0)]).await?;
    stream.flush().await?;

    match stream.recv().await? {
        RecvOutcome::Delivered(pkt) => {
            let values = pkt.unpack("%d")?;
            println!(
                "sum over {} back-ends: {:?}",
                stream.members().len(),
                values[0]
            );
        }
        RecvOutcome::Closed => println!("stream closed before a result arrived"),
    }

    net.shutdown().await
}

async fn backend_main(net: Network) {
    let rank = net.local_rank();
    loop {
        match net.recv().await {
            Ok(NetworkRecv::Delivered { stream, .. }) => {
                let reply = stream
                    .send(TAG_REPORT, "%d", &[Value::Int32(rank as i32)])
                    .await;
                if reply.is_err() {
                    break;
                }
            }
            Ok(NetworkRecv::Closed) | Err(_) => break,
        }
    }
}
