// Copyright 2022 Ryan Seipp
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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! A reactor-driven runtime that hosts one or more Thrift services behind a shared
//! worker pool.
//!
//! The pieces, leaves first: [`telemetry`] for counters and timers, [`hub`] for the
//! single-threaded reactor and its cross-thread callback queue, [`net`] for the
//! socket traits that make the acceptor testable without a real kernel, [`connection`]
//! for the per-connection framed protocol state machine, [`acceptor`] for listening
//! sockets and their live-connection sets, [`services`] for the processor registry,
//! [`worker`] for the bounded off-reactor executor with backpressure, and [`task`] for
//! the cooperative task handles layered on top of [`hub`]. [`app`] wires all of the
//! above into a single `Application`.

pub mod acceptor;
pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod net;
pub mod services;
pub mod task;
pub mod telemetry;
pub mod worker;
