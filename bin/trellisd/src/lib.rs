// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The per-cell daemon: lease bootstrap, the two convergers, and the
//! health and debug servers.

#![deny(unused_must_use)]

pub mod bootstrap;
pub mod server;

use slog::Logger;
use slog::error;
use slog::info;
use tokio::signal;
use tokio::signal::unix::SignalKind;

/// Resolve on the first SIGINT or SIGTERM.
pub async fn shutdown_signal(log: &Logger) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(log, "installing SIGINT handler"; "error" => %e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(log, "installing SIGTERM handler"; "error" => %e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!(log, "received SIGINT, shutting down"),
        _ = terminate => info!(log, "received SIGTERM, shutting down"),
    }
}
