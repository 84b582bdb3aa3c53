// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters are configured through the `ARB_LOG` environment variable using the
//! usual `tracing_subscriber::EnvFilter` syntax, e.g.
//! `ARB_LOG=info,arbor_net::topology=trace`. The default level is `info`.
//!
//! Initialization is idempotent; library code never initializes logging on its
//! own, binaries and tests call [`init`] explicitly.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "ARB_LOG";

/// Default log level when `ARB_LOG` is unset.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
