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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::channel::Channel;
use crate::poller::{epoll, Poll};
use crate::sys;
use crate::timer_queue::{TimerEntry, TimerHandle, TimerQueue};
use crate::timestamp::Timestamp;

const POLL_TIME_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT: RefCell<Option<Weak<Reactor>>> = const { RefCell::new(None) };
}

/// State a reactor shares with its [`Controller`]s: everything another
/// thread may legitimately touch. The pending-task list is the only data
/// structure in the library held under a lock.
struct Shared {
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    wake_fd: RawFd,
    thread: ThreadId,
}

impl Drop for Shared {
    fn drop(&mut self) { sys::close_fd(self.wake_fd) }
}

/// The per-thread event loop.
///
/// A reactor is created and driven on a single thread; at most one may exist
/// per thread. Everything it owns — poller, timer queue, channels and the
/// connections assigned to it — is mutated only on that thread. Other
/// threads interact with it exclusively through its [`Controller`].
pub struct Reactor {
    shared: Arc<Shared>,
    poller: RefCell<Box<dyn Poll>>,
    timers: RefCell<TimerQueue>,
    wake_channel: RefCell<Option<Rc<Channel>>>,
    timer_channel: RefCell<Option<Rc<Channel>>>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
    poll_return_time: Cell<Timestamp>,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    current_active: RefCell<Option<Rc<Channel>>>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl Reactor {
    /// Creates the reactor for the current thread using the default (epoll)
    /// readiness backend.
    pub fn new() -> Rc<Reactor> { Reactor::with_poller(Box::new(epoll::Poller::new())) }

    /// Creates the reactor for the current thread over a caller-provided
    /// readiness backend.
    pub fn with_poller(poller: Box<dyn Poll>) -> Rc<Reactor> {
        sys::ignore_sigpipe();

        let wake_fd = sys::create_eventfd();
        let reactor = Rc::new(Reactor {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                calling_pending: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                wake_fd,
                thread: thread::current().id(),
            }),
            poller: RefCell::new(poller),
            timers: RefCell::new(TimerQueue::new()),
            wake_channel: RefCell::new(None),
            timer_channel: RefCell::new(None),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            iteration: Cell::new(0),
            poll_return_time: Cell::new(Timestamp::invalid()),
            active_channels: RefCell::new(Vec::new()),
            current_active: RefCell::new(None),
            context: RefCell::new(None),
        });

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                log::error!(
                    target: "reactor",
                    "Another reactor already exists in thread {:?}", thread::current().id()
                );
                panic!("at most one reactor per thread");
            }
            *current = Some(Rc::downgrade(&reactor));
        });
        log::debug!(
            target: "reactor",
            "Reactor created in thread {:?}", thread::current().id()
        );

        let wake_channel = Channel::new(&reactor, wake_fd);
        wake_channel.set_read_callback(move |_| sys::read_eventfd(wake_fd));
        wake_channel.enable_reading();
        *reactor.wake_channel.borrow_mut() = Some(wake_channel);

        let timerfd = reactor.timers.borrow().timerfd();
        let timer_channel = Channel::new(&reactor, timerfd);
        let weak = Rc::downgrade(&reactor);
        timer_channel.set_read_callback(move |_| {
            if let Some(reactor) = weak.upgrade() {
                reactor.fire_timers();
            }
        });
        timer_channel.enable_reading();
        *reactor.timer_channel.borrow_mut() = Some(timer_channel);

        reactor
    }

    /// The reactor owned by the calling thread, if one exists.
    pub fn current() -> Option<Rc<Reactor>> {
        CURRENT.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// A cloneable, `Send` handle to this reactor.
    pub fn controller(&self) -> Controller {
        Controller {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool { thread::current().id() == self.shared.thread }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            log::error!(
                target: "reactor",
                "Reactor owned by thread {:?} used from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
            panic!("reactor used outside its owning thread");
        }
    }

    /// Runs the loop until a quit request is observed. Only callable on the
    /// creation thread.
    ///
    /// The quit flag is one-shot: a `quit()` issued before `run()` must not
    /// be lost, so the flag is never reset here.
    pub fn run(&self) {
        assert!(!self.looping.get());
        self.assert_in_loop_thread();
        self.looping.set(true);
        log::trace!(target: "reactor", "Reactor starts looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            {
                let mut active = self.active_channels.borrow_mut();
                active.clear();
                match self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active) {
                    Ok(timestamp) => self.poll_return_time.set(timestamp),
                    Err(err) => {
                        log::error!(target: "reactor", "Poll failed: {err}");
                        self.poll_return_time.set(Timestamp::now());
                    }
                }
            }
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            let active = self.active_channels.borrow().clone();
            for channel in &active {
                *self.current_active.borrow_mut() = Some(channel.clone());
                channel.handle_event(self.poll_return_time.get());
            }
            *self.current_active.borrow_mut() = None;
            self.event_handling.set(false);

            self.drain_pending();
        }

        log::trace!(target: "reactor", "Reactor stops looping");
        self.looping.set(false);
    }

    /// Requests loop termination. Idempotent; safe from any thread.
    pub fn quit(&self) { self.controller().quit() }

    /// Runs `task` now when called on the loop thread, otherwise enqueues it
    /// and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.controller().run_in_loop(task)
    }

    /// Enqueues `task` unconditionally; it runs after the current iteration
    /// finishes dispatching.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.controller().queue_in_loop(task)
    }

    pub fn queue_size(&self) -> usize { self.controller().queue_size() }

    /// Schedules `callback` at the absolute time `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerHandle {
        self.controller().run_at(when, callback)
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        self.controller().run_after(delay, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval from
    /// now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        self.controller().run_every(interval, callback)
    }

    pub fn cancel(&self, handle: TimerHandle) { self.controller().cancel(handle) }

    /// Loop iterations completed so far.
    pub fn iteration(&self) -> u64 { self.iteration.get() }

    /// Time the poller last returned; usually means data arrival.
    pub fn poll_return_time(&self) -> Timestamp { self.poll_return_time.get() }

    pub fn set_context(&self, context: Box<dyn Any>) {
        *self.context.borrow_mut() = Some(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any>> { self.context.borrow_mut().take() }

    /// Adds or refreshes the kernel registration of a channel owned by this
    /// reactor. Called by the channel itself on interest changes.
    pub fn update_channel(&self, channel: &Rc<Channel>) {
        assert!(std::ptr::eq(channel.owner_reactor(), self));
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Unregisters a channel owned by this reactor.
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        assert!(std::ptr::eq(channel.owner_reactor(), self));
        self.assert_in_loop_thread();
        if self.event_handling.get() {
            // Mid-dispatch removal is only sane for the channel currently
            // being dispatched, or one that was not ready this tick.
            let is_current = self
                .current_active
                .borrow()
                .as_ref()
                .map_or(false, |current| Rc::ptr_eq(current, channel));
            let is_active = self
                .active_channels
                .borrow()
                .iter()
                .any(|active| Rc::ptr_eq(active, channel));
            assert!(is_current || !is_active);
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        assert!(std::ptr::eq(channel.owner_reactor(), self));
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub(crate) fn add_timer_in_loop(
        &self,
        handle: TimerHandle,
        when: Timestamp,
        interval: Duration,
        repeat: bool,
        callback: Box<dyn FnMut() + Send>,
    ) {
        self.assert_in_loop_thread();
        let entry = TimerEntry::new(handle, when, interval, repeat, callback);
        self.timers.borrow_mut().add(entry);
    }

    pub(crate) fn cancel_timer_in_loop(&self, handle: TimerHandle) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().cancel(handle.sequence());
    }

    /// Read callback of the timer channel: harvest due entries, run them,
    /// reschedule the periodic survivors. Callbacks may themselves add or
    /// cancel timers; no index borrow is held while they run.
    fn fire_timers(&self) {
        self.assert_in_loop_thread();
        let now = Timestamp::now();
        let expired = self.timers.borrow_mut().expire(now);
        for entry in &expired {
            entry.run();
        }
        self.timers.borrow_mut().reschedule(expired, now);
    }

    /// Swaps the pending list out under the lock, then runs the tasks with
    /// the lock released so they can enqueue freely. While this drain is in
    /// flight, `queue_in_loop` wakes the loop even from the loop thread, so
    /// freshly queued tasks get served next iteration rather than stalling
    /// until the next readiness event.
    fn drain_pending(&self) {
        let mut tasks = Vec::new();
        self.shared.calling_pending.store(true, Ordering::Release);
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("pending task mutex poisoned");
            std::mem::swap(&mut tasks, &mut *pending);
        }
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        log::debug!(
            target: "reactor",
            "Reactor of thread {:?} destructs in thread {:?}",
            self.shared.thread,
            thread::current().id()
        );
        // The weak back-references inside the channels can no longer be
        // upgraded at this point, so the poller is addressed directly.
        let mut poller = self.poller.borrow_mut();
        for slot in [&self.wake_channel, &self.timer_channel] {
            if let Some(channel) = slot.borrow_mut().take() {
                channel.clear_interest();
                poller.remove_channel(&channel);
                channel.mark_removed();
            }
        }
        drop(poller);
        CURRENT.with(|current| *current.borrow_mut() = None);
    }
}

/// Cloneable, `Send` face of a [`Reactor`]: the only way other threads talk
/// to a loop. Cross-thread task posting, quit and timer scheduling wake the
/// target loop through its wake-up descriptor.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn is_in_reactor_thread(&self) -> bool { thread::current().id() == self.shared.thread }

    /// Runs `task` inline when called on the reactor's thread; otherwise
    /// enqueues it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_reactor_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` unconditionally. Wakes the loop when called from
    /// another thread, or when the loop is draining its pending list.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("pending task mutex poisoned");
            pending.push(Box::new(task));
        }
        if !self.is_in_reactor_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.shared
            .pending
            .lock()
            .expect("pending task mutex poisoned")
            .len()
    }

    /// Requests loop termination. Idempotent; wakes the loop when issued
    /// from another thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_reactor_thread() {
            self.wakeup();
        }
    }

    /// Schedules `callback` at the absolute time `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerHandle {
        self.schedule(when, Duration::ZERO, false, Box::new(callback))
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        self.schedule(Timestamp::now() + interval, interval, true, Box::new(callback))
    }

    /// Cancels a scheduled timer. Cancelling a timer from within its own
    /// callback prevents a periodic re-arm; cancelling one that already ran
    /// out is a no-op.
    pub fn cancel(&self, handle: TimerHandle) {
        self.run_in_loop(move || {
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_timer_in_loop(handle);
            }
        });
    }

    fn schedule(
        &self,
        when: Timestamp,
        interval: Duration,
        repeat: bool,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerHandle {
        let handle = TimerHandle::allocate();
        self.run_in_loop(move || {
            let reactor = Reactor::current().expect("timer tasks execute on the reactor thread");
            reactor.add_timer_in_loop(handle, when, interval, repeat, callback);
        });
        handle
    }

    fn wakeup(&self) { sys::write_eventfd(self.shared.wake_fd) }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::poller;

    #[test]
    #[should_panic(expected = "at most one reactor per thread")]
    fn second_reactor_on_thread_panics() {
        let _first = Reactor::new();
        let _second = Reactor::new();
    }

    #[test]
    fn reactor_slot_is_freed_on_drop() {
        {
            let reactor = Reactor::new();
            assert!(Reactor::current().is_some());
            drop(reactor);
        }
        assert!(Reactor::current().is_none());
        let _again = Reactor::new();
    }

    #[test]
    fn quit_from_another_thread_stops_the_loop() {
        let reactor = Reactor::new();
        let controller = reactor.controller();
        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            controller.quit();
        });
        reactor.run();
        quitter.join().unwrap();
        assert!(reactor.iteration() >= 1);
    }

    #[test]
    fn quit_before_run_is_not_lost() {
        let reactor = Reactor::new();
        reactor.quit();
        let start = Instant::now();
        reactor.run();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn run_in_loop_is_inline_on_the_loop_thread() {
        let reactor = Reactor::new();
        assert!(reactor.is_in_loop_thread());
        let (tx, rx) = mpsc::channel();
        reactor.run_in_loop(move || tx.send(42).unwrap());
        // The task ran synchronously; the loop never even started.
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn queued_tasks_run_in_fifo_order_across_threads() {
        let reactor = Reactor::new();
        let controller = reactor.controller();
        let order = Arc::new(Mutex::new(Vec::new()));

        let observed = order.clone();
        let quit = reactor.controller();
        let poster = thread::spawn(move || {
            for i in 0..100 {
                let observed = observed.clone();
                controller.queue_in_loop(move || observed.lock().unwrap().push(i));
            }
            controller.queue_in_loop(move || quit.quit());
        });
        reactor.run();
        poster.join().unwrap();
        let observed = order.lock().unwrap();
        assert_eq!(*observed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn task_queued_by_a_pending_task_runs_next_iteration() {
        let reactor = Reactor::new();
        let controller = reactor.controller();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_outer = hits.clone();
        let inner_controller = reactor.controller();
        let quit = reactor.controller();
        let poster = thread::spawn(move || {
            controller.queue_in_loop(move || {
                hits_outer.fetch_add(1, Ordering::SeqCst);
                let hits_inner = hits_outer.clone();
                inner_controller.queue_in_loop(move || {
                    hits_inner.fetch_add(1, Ordering::SeqCst);
                    quit.quit();
                });
            });
        });
        reactor.run();
        poster.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_after_fires_once() {
        let reactor = Reactor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let quit = reactor.controller();
        reactor.run_after(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            quit.quit();
        });
        reactor.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_every_repeats_until_cancelled_from_inside() {
        let reactor = Reactor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let controller = reactor.controller();
        let quitter = reactor.controller();
        let handle_slot = Arc::new(Mutex::new(None::<TimerHandle>));
        let slot = handle_slot.clone();
        let handle = reactor.run_every(Duration::from_millis(10), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                let handle = slot.lock().unwrap().expect("handle registered before first fire");
                controller.cancel(handle);
                let stop = quitter.clone();
                quitter.run_after(Duration::from_millis(60), move || stop.quit());
            }
        });
        *handle_slot.lock().unwrap() = Some(handle);
        reactor.run();
        // Three fires, then the in-callback cancel stops the re-arm.
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_one_shot_timer_never_fires() {
        let reactor = Reactor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let handle = reactor.run_after(Duration::from_millis(40), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reactor.cancel(handle);
        let quit = reactor.controller();
        reactor.run_after(Duration::from_millis(80), move || quit.quit());
        reactor.run();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    fn readiness_reaches_a_channel(reactor: Rc<Reactor>) {
        use std::io::{Read, Write};
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let quit = reactor.controller();
        let channel = Channel::new(&reactor, rx.as_raw_fd());
        channel.set_read_callback(move |_| {
            let mut buf = [0u8; 16];
            let n = (&rx).read(&mut buf).unwrap();
            sink.lock().unwrap().extend_from_slice(&buf[..n]);
            quit.quit();
        });
        channel.enable_reading();

        tx.write_all(b"ready").unwrap();
        reactor.run();
        assert_eq!(&*received.lock().unwrap(), b"ready");

        channel.disable_all();
        channel.remove();
        assert!(!reactor.has_channel(&channel));
    }

    #[test]
    fn epoll_backend_dispatches_readiness() { readiness_reaches_a_channel(Reactor::new()) }

    #[test]
    fn poll_backend_dispatches_readiness() {
        readiness_reaches_a_channel(Reactor::with_poller(Box::new(poller::poll::Poller::new())))
    }

    #[test]
    fn poll_backend_drives_the_loop_too() {
        let reactor = Reactor::with_poller(Box::new(poller::poll::Poller::new()));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let quit = reactor.controller();
        reactor.run_after(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            quit.quit();
        });
        reactor.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
