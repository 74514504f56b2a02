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

//! I/O multiplexer abstraction underneath a [`crate::Reactor`].
//!
//! A poller owns the kernel-side registration of every channel of its
//! reactor, keyed by file descriptor, and yields the set of channels that
//! became ready on each tick. Two interchangeable backends are provided:
//! [`poll::Poller`] over `poll(2)` and [`epoll::Poller`] over `epoll(7)`.

pub mod epoll;
pub mod poll;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::rc::Rc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

/// Interest set of a channel: which readiness kinds its reactor should be
/// told about.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct Interest {
    /// Wants to be told when the descriptor has data to read.
    pub read: bool,
    /// Wants to be told when the descriptor accepts writes.
    pub write: bool,
}

impl Interest {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
}

impl Display for Interest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.read && self.write {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

/// Readiness observed by a poller for one channel on one tick, as raw
/// `poll(2)` revent bits (the epoll backend translates into the same bits).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Ready(i16);

impl Ready {
    pub const NONE: Ready = Ready(0);

    pub(crate) fn from_poll_bits(bits: i16) -> Self { Ready(bits) }

    /// Readable in the wide sense: data, priority data, or the peer closed
    /// its write side.
    pub fn is_readable(self) -> bool {
        self.0 & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0
    }

    pub fn is_writable(self) -> bool { self.0 & libc::POLLOUT != 0 }

    pub fn is_error(self) -> bool { self.0 & libc::POLLERR != 0 }

    pub fn is_invalid(self) -> bool { self.0 & libc::POLLNVAL != 0 }

    /// Hang-up with nothing left to read: the close, not the drain, path.
    pub fn is_hangup_without_input(self) -> bool {
        self.0 & libc::POLLHUP != 0 && self.0 & libc::POLLIN == 0
    }
}

impl Display for Ready {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (bit, name) in [
            (libc::POLLIN, "IN "),
            (libc::POLLPRI, "PRI "),
            (libc::POLLOUT, "OUT "),
            (libc::POLLHUP, "HUP "),
            (libc::POLLRDHUP, "RDHUP "),
            (libc::POLLERR, "ERR "),
            (libc::POLLNVAL, "NVAL "),
        ] {
            if self.0 & bit != 0 {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// The readiness primitive behind a reactor. All three mutating operations
/// are constrained to the owning reactor's thread; the reactor enforces this
/// before delegating.
pub trait Poll {
    /// Blocks up to `timeout_ms`, records observed readiness inside each
    /// ready channel and appends those channels to `active`. Returns the
    /// post-wake timestamp. An interrupted wait is not an error: it returns
    /// with an empty ready set.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> io::Result<Timestamp>;

    /// Adds a fresh channel, re-adds a re-enabled one, or updates the
    /// registered interest of a known one. A channel whose interest became
    /// empty is parked but stays known to the poller.
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Forgets a parked channel. The channel's interest set must be empty.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether this channel is currently known to the poller.
    fn has_channel(&self, channel: &Channel) -> bool;
}
