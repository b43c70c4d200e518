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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::config;
use crate::common::error::{Error, Result};
use crate::runtime::mem_tracker::{self, MemTracker};

/// Per-session execution options handed in by the driving layer.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Maximum row count per in-memory chunk. Values <= 0 fall back to the
    /// configured default.
    pub batch_size: Option<i32>,
    /// Session memory ceiling in bytes. Values <= 0 mean unlimited.
    pub mem_limit: Option<i64>,
    pub enable_profile: Option<bool>,
}

/// RuntimeState is a per-session execution context.
///
/// It provides access to frequently used query options (e.g. `batch_size` /
/// chunk size), the session memory tracker, the first-error latch, and the
/// cooperative cancellation flag. Clones share the error latch and the
/// cancellation flag, so cancelling any clone cancels the session.
#[derive(Debug)]
pub struct RuntimeState {
    query_options: Option<QueryOptions>,
    error_state: Arc<RuntimeErrorState>,
    cancelled: Arc<AtomicBool>,
    mem_tracker: Option<Arc<MemTracker>>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: std::sync::Mutex<Option<Error>>,
}

impl RuntimeErrorState {
    /// Record the first fatal error of the session; later errors are dropped.
    pub fn set_error(&self, err: Error) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            query_options: None,
            error_state: Arc::new(RuntimeErrorState::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            mem_tracker: None,
        }
    }
}

impl Clone for RuntimeState {
    fn clone(&self) -> Self {
        Self {
            query_options: self.query_options.clone(),
            error_state: Arc::clone(&self.error_state),
            cancelled: Arc::clone(&self.cancelled),
            mem_tracker: self.mem_tracker.clone(),
        }
    }
}

impl RuntimeState {
    pub fn new(
        query_options: Option<QueryOptions>,
        mem_tracker: Option<Arc<MemTracker>>,
    ) -> Self {
        let mem_tracker = mem_tracker.or_else(|| {
            let limit = query_options
                .as_ref()
                .and_then(|opts| opts.mem_limit)
                .filter(|v| *v > 0)?;
            let process = mem_tracker::process_mem_tracker();
            Some(MemTracker::new_child_with_limit("query", limit, &process))
        });
        Self {
            query_options,
            error_state: Arc::new(RuntimeErrorState::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            mem_tracker,
        }
    }

    pub fn query_options(&self) -> Option<&QueryOptions> {
        self.query_options.as_ref()
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn set_error(&self, err: Error) {
        self.error_state.set_error(err);
    }

    pub fn error(&self) -> Option<Error> {
        self.error_state.error()
    }

    /// Request cooperative cancellation. Sorter and merger calls observe the
    /// flag at their next call boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Return the maximum row count per in-memory chunk/RecordBatch.
    ///
    /// The session's `batch_size` option wins; otherwise the configured
    /// default applies.
    pub fn chunk_size(&self) -> usize {
        self.query_options
            .as_ref()
            .and_then(|opts| opts.batch_size)
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or_else(config::chunk_size)
            .max(1)
    }

    pub fn enable_profile(&self) -> bool {
        self.query_options
            .as_ref()
            .and_then(|opts| opts.enable_profile)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_falls_back_to_default() {
        let state = RuntimeState::default();
        assert_eq!(state.chunk_size(), 4096);

        let state = RuntimeState::new(
            Some(QueryOptions {
                batch_size: Some(0),
                ..Default::default()
            }),
            None,
        );
        assert_eq!(state.chunk_size(), 4096);

        let state = RuntimeState::new(
            Some(QueryOptions {
                batch_size: Some(128),
                ..Default::default()
            }),
            None,
        );
        assert_eq!(state.chunk_size(), 128);
    }

    #[test]
    fn cancellation_is_shared_across_clones() {
        let state = RuntimeState::default();
        let clone = state.clone();
        assert!(clone.check_canceled().is_ok());

        state.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check_canceled(), Err(Error::Cancelled)));
    }

    #[test]
    fn first_error_wins() {
        let state = RuntimeState::default();
        state
            .error_state()
            .set_error(Error::Upstream("first".to_string()));
        state
            .error_state()
            .set_error(Error::Upstream("second".to_string()));
        match state.error() {
            Some(Error::Upstream(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected error state: {other:?}"),
        }
    }

    #[test]
    fn mem_limit_creates_a_limited_session_tracker() {
        let state = RuntimeState::new(
            Some(QueryOptions {
                mem_limit: Some(1024),
                ..Default::default()
            }),
            None,
        );
        let tracker = state.mem_tracker().expect("session tracker");
        assert_eq!(tracker.limit(), 1024);
        assert!(tracker.try_consume(2048).is_err());
    }
}
