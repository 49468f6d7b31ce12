// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared between the cell daemon, the controller, and the
//! operator tooling.
//!
//! Everything in here is plain data with a serde representation. The
//! JSON shapes are part of the wire contract with the controller and
//! the on-disk contract with the CNI plug-in, so field names must not
//! change without bumping [`API_VERSION`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod container;
pub mod lease;
pub mod mac;
pub mod policy;

pub use container::*;
pub use lease::*;
pub use mac::*;
pub use policy::*;

/// The overall version of the controller API. Anytime a request or
/// response type is added, removed, or modified, this number should
/// increment.
pub const API_VERSION: u64 = 3;

/// Major version of the trellis package.
pub const MAJOR_VERSION: u64 = 0;

/// The body of any non-2xx response from the controller.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResp {
    pub error: String,
    /// A hint for the operator about how to resolve the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorResp {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), suggestion: None }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl Display for ErrorResp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.suggestion {
            Some(s) => write!(f, "{} ({})", self.error, s),
            None => write!(f, "{}", self.error),
        }
    }
}
