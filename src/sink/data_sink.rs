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
use crate::exec::chunk::Chunk;
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::runtime_state::RuntimeState;
use crate::sink::error::SinkResult;

/// Terminal operator of a query plan: consumes chunks, ships them somewhere.
///
/// The tablet-load sink is one variant; export and broker sinks share the
/// same lifecycle. `close` must be called exactly once, with the upstream
/// status, whether or not the earlier stages succeeded.
pub trait DataSink: Send {
    fn prepare(&mut self, state: &RuntimeState) -> SinkResult<()>;

    fn open(&mut self, state: &RuntimeState) -> SinkResult<()>;

    fn send(&mut self, state: &RuntimeState, chunk: &Chunk) -> SinkResult<()>;

    fn close(&mut self, state: &RuntimeState, close_status: SinkResult<()>) -> SinkResult<()>;

    fn profile(&self) -> &RuntimeProfile;
}
