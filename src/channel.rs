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

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Weak as WeakArc;

use crate::poller::{Interest, Ready};
use crate::reactor::Reactor;
use crate::timestamp::Timestamp;

/// Callback slot for write, close and error readiness.
pub type EventCallback = Box<dyn FnMut()>;
/// Callback slot for read readiness; receives the poll-return timestamp.
pub type ReadEventCallback = Box<dyn FnMut(Timestamp)>;

/// Binding of one file descriptor to its interest set and readiness
/// callbacks within one reactor.
///
/// A channel does not own its descriptor: the descriptor belongs to whatever
/// created the channel (a connected socket, an eventfd, a timerfd, a
/// listening socket). Every operation must happen on the owning reactor's
/// thread, and a channel must outlive any dispatch involving it; both flags
/// are asserted when it is dropped.
pub struct Channel {
    /// Weak self-reference, so interest changes can hand the poller the
    /// `Rc` it keeps in its descriptor map.
    this: Weak<Channel>,
    reactor: Weak<Reactor>,
    fd: RawFd,
    interest: Cell<Interest>,
    ready: Cell<Ready>,
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tie: RefCell<Option<WeakArc<dyn Any + Send + Sync>>>,
    handling_event: Cell<bool>,
    added_to_reactor: Cell<bool>,
    read_callback: RefCell<Option<ReadEventCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(reactor: &Rc<Reactor>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|this| Channel {
            this: this.clone(),
            reactor: Rc::downgrade(reactor),
            fd,
            interest: Cell::new(Interest::none()),
            ready: Cell::new(Ready::NONE),
            index: Cell::new(-1),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            handling_event: Cell::new(false),
            added_to_reactor: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd { self.fd }

    pub fn interest(&self) -> Interest { self.interest.get() }

    pub fn is_none_event(&self) -> bool { self.interest.get().is_none() }

    pub fn is_reading(&self) -> bool { self.interest.get().read }

    pub fn is_writing(&self) -> bool { self.interest.get().write }

    /// Backend-private registration slot (a pollfd position for the
    /// `poll(2)` backend, a registration state for the epoll backend).
    pub(crate) fn index(&self) -> i32 { self.index.get() }

    pub(crate) fn set_index(&self, index: i32) { self.index.set(index) }

    /// Written by the poller before the channel is dispatched.
    pub(crate) fn set_ready(&self, ready: Ready) { self.ready.set(ready) }

    pub fn set_read_callback(&self, callback: impl FnMut(Timestamp) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Weakly ties this channel to its logical owner. At dispatch time the
    /// tie is upgraded, pinning the owner for the duration of that one
    /// dispatch; if the owner is already gone the event is dropped silently.
    pub fn tie(&self, owner: WeakArc<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(owner);
    }

    /// Hang-up on descriptors that legitimately never hang up (wake and
    /// timer descriptors) need not be warned about.
    pub fn do_not_log_hup(&self) { self.log_hup.set(false) }

    pub fn enable_reading(&self) {
        let mut interest = self.interest.get();
        interest.read = true;
        self.interest.set(interest);
        self.update();
    }

    pub fn disable_reading(&self) {
        let mut interest = self.interest.get();
        interest.read = false;
        self.interest.set(interest);
        self.update();
    }

    pub fn enable_writing(&self) {
        let mut interest = self.interest.get();
        interest.write = true;
        self.interest.set(interest);
        self.update();
    }

    pub fn disable_writing(&self) {
        let mut interest = self.interest.get();
        interest.write = false;
        self.interest.set(interest);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.set(Interest::none());
        self.update();
    }

    /// Unregisters the channel from its reactor. The interest set must have
    /// been emptied first.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_reactor.set(false);
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.remove_channel(&self.shared_from_this());
        } else {
            log::error!(target: "reactor", "Removing channel (fd={}) after its reactor is gone", self.fd);
        }
    }

    fn update(&self) {
        self.added_to_reactor.set(true);
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.update_channel(&self.shared_from_this());
        } else {
            log::error!(target: "reactor", "Updating channel (fd={}) after its reactor is gone", self.fd);
        }
    }

    fn shared_from_this(&self) -> Rc<Channel> {
        self.this
            .upgrade()
            .expect("channel methods run while the channel is alive")
    }

    pub(crate) fn owner_reactor(&self) -> *const Reactor { self.reactor.as_ptr() }

    // Teardown helpers used while the reactor itself is being dropped and
    // the weak back-reference can no longer be upgraded.
    pub(crate) fn clear_interest(&self) { self.interest.set(Interest::none()) }

    pub(crate) fn mark_removed(&self) { self.added_to_reactor.set(false) }

    /// Dispatches the readiness recorded by the poller, holding the tied
    /// owner alive for the duration if a tie was set.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let tied = self.tie.borrow().clone();
        let _guard: Option<std::sync::Arc<dyn Any + Send + Sync>> = match tied {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                None => return,
            },
            None => None,
        };
        self.handle_event_guarded(receive_time);
    }

    fn handle_event_guarded(&self, receive_time: Timestamp) {
        self.handling_event.set(true);
        let ready = self.ready.get();
        log::trace!(target: "reactor", "Channel fd={} dispatching {{{ready}}}", self.fd);

        if ready.is_hangup_without_input() {
            if self.log_hup.get() {
                log::warn!(target: "reactor", "Channel fd={} got POLLHUP", self.fd);
            }
            if let Some(callback) = self.close_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        if ready.is_invalid() {
            log::warn!(target: "reactor", "Channel fd={} got POLLNVAL", self.fd);
        }
        if ready.is_error() || ready.is_invalid() {
            if let Some(callback) = self.error_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        if ready.is_readable() {
            if let Some(callback) = self.read_callback.borrow_mut().as_mut() {
                callback(receive_time);
            }
        }
        if ready.is_writable() {
            if let Some(callback) = self.write_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        self.handling_event.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.handling_event.get());
        debug_assert!(!self.added_to_reactor.get());
    }
}
