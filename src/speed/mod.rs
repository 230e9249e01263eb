// Copyright 2026 the sppbench authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Throughput measurement: the engine, its shared counters, and the
//! sample/result records it produces.

mod counters;
mod engine;
mod report;

pub use counters::{LatencyStat, LocalTally, RunCounters, FLUSH_BATCH};
pub use engine::{
    run, Completed, EngineError, PayloadPattern, Progress, ProgressFn, TestConfig, TestLimit,
    TestMode, BOUNDED_RUN_GUARD, SAMPLE_INTERVAL,
};
pub use report::{human_bps, human_bytes, LinkDiagnostics, ThroughputResult, ThroughputSample};
