// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Error type shared by the sort/merge execution paths.
//!
//! Responsibilities:
//! - Classify failures so callers can react (memory ceiling, upstream,
//!   bad configuration, cancellation).
//! - Stay `Clone` so a failed sorter or merger instance can hand back the
//!   same error on every call after the first failure.

use arrow::error::ArrowError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A tracked allocation would push some tracker past its limit.
    #[error(
        "memory limit exceeded: consume {bytes} bytes would pass limit {limit} (already consumed {consumed})"
    )]
    MemLimitExceeded { bytes: i64, limit: i64, consumed: i64 },

    /// The session was cancelled; surfaced at the next call boundary.
    #[error("cancelled")]
    Cancelled,

    /// Rejected at construction or on misuse of the call protocol.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A chunk supplier or sort-key expression failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Arrow kernel failure, kept as text so the enum stays `Clone`.
    #[error("arrow error: {0}")]
    Arrow(String),

    /// Broken invariant inside this crate.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ArrowError> for Error {
    fn from(e: ArrowError) -> Self {
        Error::Arrow(e.to_string())
    }
}
