// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection for producer identities.

use std::env;
use tracing::warn;

/// Returns the machine name a producer reports in the `Host` field.
///
/// Resolution order:
/// 1. `LOGBUS_HOSTNAME`
/// 2. `HOSTNAME`
/// 3. `nix::unistd::gethostname()`
/// 4. `"unknown"`
#[must_use]
pub fn get_hostname() -> String {
    for variable in ["LOGBUS_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(variable) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => match hostname.into_string() {
            Ok(hostname) if !hostname.is_empty() => return hostname,
            Ok(_) => warn!("System hostname is empty"),
            Err(_) => warn!("System hostname is not valid UTF-8"),
        },
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
