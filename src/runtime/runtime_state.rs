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
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::{self, MemTracker};
use crate::service::tablet_writer::proto::PTabletInfo;
use crate::tabletload_logging::debug;

/// Per-fragment-instance execution context.
///
/// Carries the query options the sink reads (batch size, sender identity),
/// the first-error latch, and the commit metadata collected from the final
/// eos replies for the external transaction coordinator.
#[derive(Debug)]
pub struct RuntimeState {
    query_id: Option<UniqueId>,
    batch_size: usize,
    sender_id: i32,
    num_senders: i32,
    cancelled: AtomicBool,
    error_state: Arc<RuntimeErrorState>,
    mem_tracker: Arc<MemTracker>,
    tablet_commit_infos: Mutex<Vec<PTabletInfo>>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(None, 1024, 0, 1)
    }
}

impl RuntimeState {
    pub fn new(
        query_id: Option<UniqueId>,
        batch_size: usize,
        sender_id: i32,
        num_senders: i32,
    ) -> Self {
        let process = mem_tracker::process_mem_tracker();
        let label = query_id
            .map(|id| format!("query_{:x}_{:x}", id.hi, id.lo))
            .unwrap_or_else(|| "query_unknown".to_string());
        Self {
            query_id,
            batch_size: batch_size.max(1),
            sender_id,
            num_senders: num_senders.max(1),
            cancelled: AtomicBool::new(false),
            error_state: Arc::new(RuntimeErrorState::default()),
            mem_tracker: MemTracker::new_child(label, &process),
            tablet_commit_infos: Mutex::new(Vec::new()),
        }
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.query_id
    }

    /// Maximum row count per in-memory batch; also the per-channel packet
    /// row cap on the send path.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sender_id(&self) -> i32 {
        self.sender_id
    }

    pub fn num_senders(&self) -> i32 {
        self.num_senders
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.mem_tracker)
    }

    pub fn add_tablet_commit_infos(&self, infos: impl IntoIterator<Item = PTabletInfo>) {
        let mut guard = self
            .tablet_commit_infos
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for info in infos {
            debug!(
                "add tablet commit info: tablet_id={} schema_hash={}",
                info.tablet_id, info.schema_hash
            );
            guard.push(info);
        }
    }

    pub fn tablet_commit_infos(&self) -> Vec<PTabletInfo> {
        self.tablet_commit_infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
