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

//! `poll(2)` backend: the portable baseline readiness primitive.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::channel::Channel;
use crate::poller::{Interest, Poll, Ready};
use crate::sys::syscall;
use crate::timestamp::Timestamp;

fn interest_bits(interest: Interest) -> i16 {
    let mut bits = 0;
    if interest.read {
        bits |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.write {
        bits |= libc::POLLOUT;
    }
    bits
}

/// A channel with an empty interest set keeps its pollfd slot, parked under
/// a negated descriptor so the kernel skips it. `-1` is taken (it means "no
/// entry" to `poll(2)` itself), hence the extra offset.
fn parked_fd(fd: RawFd) -> RawFd { -fd - 1 }

pub struct Poller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poller {
    pub fn new() -> Self {
        Poller {
            pollfds: empty!(),
            channels: empty!(),
        }
    }
}

impl Poll for Poller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> io::Result<Timestamp> {
        let result = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms
        ));
        let now = Timestamp::now();
        let mut remaining = match result {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        if remaining == 0 {
            log::trace!(target: "reactor", "Nothing happened within {timeout_ms} ms");
            return Ok(now);
        }
        log::trace!(target: "reactor", "{remaining} channel(s) ready");
        for pollfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pollfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let channel = self
                .channels
                .get(&pollfd.fd)
                .expect("pollfd entry without a registered channel");
            channel.set_ready(Ready::from_poll_bits(pollfd.revents));
            active.push(channel.clone());
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        log::trace!(
            target: "reactor",
            "Updating channel fd={fd} to interest `{}`", channel.interest()
        );
        if channel.index() < 0 {
            // A fresh channel gets a new slot at the back.
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd: if channel.is_none_event() { parked_fd(fd) } else { fd },
                events: interest_bits(channel.interest()),
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            assert!(self.channels.contains_key(&fd));
            let index = channel.index() as usize;
            assert!(index < self.pollfds.len());
            let pollfd = &mut self.pollfds[index];
            assert!(pollfd.fd == fd || pollfd.fd == parked_fd(fd));
            pollfd.events = interest_bits(channel.interest());
            pollfd.revents = 0;
            pollfd.fd = if channel.is_none_event() { parked_fd(fd) } else { fd };
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index() as usize;
        assert!(index < self.pollfds.len());
        log::trace!(target: "reactor", "Removing channel fd={fd}");

        self.channels.remove(&fd);
        let last = self.pollfds.len() - 1;
        if index != last {
            self.pollfds.swap(index, last);
            let mut moved_fd = self.pollfds[index].fd;
            if moved_fd < 0 {
                moved_fd = parked_fd(moved_fd);
            }
            self.channels
                .get(&moved_fd)
                .expect("pollfd entry without a registered channel")
                .set_index(index as i32);
        }
        self.pollfds.pop();
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(known) => std::ptr::eq(Rc::as_ptr(known), channel),
            None => false,
        }
    }
}
