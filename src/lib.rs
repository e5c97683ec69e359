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
pub mod common;
pub mod exec;
pub mod runtime;
pub mod service;
pub mod sink;

pub use common::app_config as tabletload_config;
pub use common::logging as tabletload_logging;

pub use common::types::UniqueId;
pub use exec::chunk::Chunk;
pub use sink::data_sink::DataSink;
pub use sink::descriptors::TableSinkParams;
pub use sink::error::{SinkError, SinkResult};
pub use sink::table_sink::TabletSink;
