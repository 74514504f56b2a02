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

//! `epoll(7)` backend: the default readiness primitive on Linux.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::channel::Channel;
use crate::poller::{Interest, Poll, Ready};
use crate::sys::{self, syscall};
use crate::timestamp::Timestamp;

// Values of the backend-private channel index: never seen by epoll,
// membership in the kernel set, known but currently deleted from it.
const STATE_NEW: i32 = -1;
const STATE_ADDED: i32 = 1;
const STATE_DELETED: i32 = 2;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.read {
        bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.write {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn ready_from_epoll(events: u32) -> Ready {
    let mut bits: i16 = 0;
    for (epoll_bit, poll_bit) in [
        (libc::EPOLLIN, libc::POLLIN),
        (libc::EPOLLPRI, libc::POLLPRI),
        (libc::EPOLLOUT, libc::POLLOUT),
        (libc::EPOLLERR, libc::POLLERR),
        (libc::EPOLLHUP, libc::POLLHUP),
        (libc::EPOLLRDHUP, libc::POLLRDHUP),
    ] {
        if events & epoll_bit as u32 != 0 {
            bits |= poll_bit;
        }
    }
    Ready::from_poll_bits(bits)
}

pub struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poller {
    /// Creates the epoll instance. Like the wake-up descriptor, a reactor
    /// cannot operate without it, so creation failure is fatal.
    pub fn new() -> Self {
        let epoll_fd = match syscall!(epoll_create1(libc::EPOLL_CLOEXEC)) {
            Ok(fd) => fd,
            Err(err) => {
                log::error!(target: "reactor", "Failed to create epoll instance: {err}");
                panic!("epoll_create1 failed: {err}");
            }
        };
        Poller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_LIST_SIZE],
            channels: empty!(),
        }
    }

    fn ctl(&self, operation: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: interest_bits(channel.interest()),
            u64: channel.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.epoll_fd, operation, channel.fd(), &mut event)) {
            let name = match operation {
                libc::EPOLL_CTL_ADD => "ADD",
                libc::EPOLL_CTL_MOD => "MOD",
                _ => "DEL",
            };
            log::error!(
                target: "reactor",
                "epoll_ctl {name} failed for fd={}: {err}", channel.fd()
            );
        }
    }
}

impl Poll for Poller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> io::Result<Timestamp> {
        let result = syscall!(epoll_wait(
            self.epoll_fd,
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms
        ));
        let now = Timestamp::now();
        let ready_count = match result {
            Ok(n) => n as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        if ready_count == 0 {
            log::trace!(target: "reactor", "Nothing happened within {timeout_ms} ms");
            return Ok(now);
        }
        log::trace!(target: "reactor", "{ready_count} channel(s) ready");
        for event in &self.events[..ready_count] {
            let fd = event.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("epoll event for an unregistered channel");
            channel.set_ready(ready_from_epoll(event.events));
            active.push(channel.clone());
        }
        if ready_count == self.events.len() {
            self.events
                .resize(ready_count * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        let state = channel.index();
        log::trace!(
            target: "reactor",
            "Updating channel fd={fd} to interest `{}`", channel.interest()
        );
        if state == STATE_NEW || state == STATE_DELETED {
            if state == STATE_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(STATE_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(state, STATE_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let state = channel.index();
        assert!(state == STATE_ADDED || state == STATE_DELETED);
        log::trace!(target: "reactor", "Removing channel fd={fd}");

        self.channels.remove(&fd);
        if state == STATE_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(known) => std::ptr::eq(Rc::as_ptr(known), channel),
            None => false,
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) { sys::close_fd(self.epoll_fd) }
}
