// Multi-reactor TCP server library: one event loop per thread.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Multi-reactor TCP server library in the "one loop per thread" tradition.
//!
//! A [`Reactor`] is a single-threaded event loop multiplexing file
//! descriptors through a [`poller::Poll`] backend; [`Channel`]s bind
//! descriptors to readiness callbacks, a timer queue drives scheduled work
//! through a timerfd, and an eventfd lets other threads wake the loop to
//! run posted tasks.
//!
//! A [`Server`] composes the pieces into a TCP front end: an acceptor
//! channel on the accept reactor hands each new connection to a worker
//! reactor from a [`ReactorPool`], and from then on all I/O for that
//! [`Connection`] executes only on that worker. Cross-thread interaction
//! goes exclusively through each reactor's [`Controller`].
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use netreactor::{Reactor, Server};
//!
//! let reactor = Reactor::new();
//! let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
//! let server = Server::new(&reactor, addr, "echo", false).unwrap();
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buffer, _when| {
//!     let data = buffer.retrieve_all_as_string();
//!     conn.send(data.as_bytes());
//! });
//! server.start().unwrap();
//! reactor.run();
//! ```

#[macro_use]
extern crate amplify;

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod pool;
pub mod poller;
mod reactor;
mod server;
mod sys;
mod thread;
mod timer_queue;
mod timestamp;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{
    ConnState, Connection, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
pub use pool::ReactorPool;
pub use reactor::{Controller, Reactor};
pub use server::Server;
pub use thread::{ReactorThread, ThreadInitCallback};
pub use timer_queue::TimerHandle;
pub use timestamp::Timestamp;
