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
use std::cell::RefCell;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use socket2::Socket;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::reactor::{Controller, Reactor};
use crate::timestamp::Timestamp;

/// Fired on both the connected and the disconnected transition.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fired when bytes arrived in the input buffer.
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer, Timestamp) + Send + Sync>;
/// Fired when the output buffer fully drained to the socket.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fired when the output buffer crossed the high-water mark from below;
/// receives the post-append buffered size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
/// Library-internal: routes a closed connection back to its server.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle. Transitions only move forward:
/// connecting → connected → disconnecting → disconnected, with the
/// disconnecting stage skipped on an abrupt peer close.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[repr(u8)]
pub enum ConnState {
    #[display("connecting")]
    Connecting = 0,
    #[display("connected")]
    Connected = 1,
    #[display("disconnecting")]
    Disconnecting = 2,
    #[display("disconnected")]
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One established TCP connection, owned by a worker reactor.
///
/// Shared as `Arc<Connection>`: the server map, the channel tie and every
/// in-flight task hold one. `send`, `shutdown` and `force_close` may be
/// called from any thread; everything else the connection does happens on
/// its reactor's thread.
pub struct Connection {
    /// Weak self-reference, so `&self` methods can mint the `Arc` their
    /// posted tasks and callbacks pin.
    this: Weak<Connection>,
    reactor: Controller,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    channel: RefCell<Option<Rc<Channel>>>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: AtomicUsize,
    on_connection: RefCell<Option<ConnectionCallback>>,
    on_message: RefCell<Option<MessageCallback>>,
    on_write_complete: RefCell<Option<WriteCompleteCallback>>,
    on_high_water_mark: RefCell<Option<HighWaterMarkCallback>>,
    on_close: RefCell<Option<CloseCallback>>,
    context: RefCell<Option<Box<dyn Any + Send>>>,
}

// The non-atomic interior (RefCell fields, the channel Rc) is touched only
// on the owning reactor's thread: before `connect_established` runs there
// the connection is owned by the accept thread alone, and publication
// happens through the reactor's mutex-protected task queue. The thread
// checks below enforce the confinement at runtime.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub(crate) fn new(
        reactor: Controller,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Connection> {
        log::debug!(
            target: "conn",
            "Connection `{name}` created: {local_addr} <- {peer_addr}"
        );
        if let Err(err) = socket.set_keepalive(true) {
            log::warn!(target: "conn", "Cannot enable keep-alive on `{name}`: {err}");
        }
        Arc::new_cyclic(|this| Connection {
            this: this.clone(),
            reactor,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: AtomicBool::new(false),
            socket,
            local_addr,
            peer_addr,
            channel: RefCell::new(None),
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            on_connection: RefCell::new(None),
            on_message: RefCell::new(None),
            on_write_complete: RefCell::new(None),
            on_high_water_mark: RefCell::new(None),
            on_close: RefCell::new(None),
            context: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    pub fn peer_addr(&self) -> SocketAddr { self.peer_addr }

    /// Controller of the reactor this connection is assigned to.
    pub fn controller(&self) -> &Controller { &self.reactor }

    pub fn state(&self) -> ConnState { ConnState::from_u8(self.state.load(Ordering::Relaxed)) }

    pub fn connected(&self) -> bool { self.state() == ConnState::Connected }

    pub fn disconnected(&self) -> bool { self.state() == ConnState::Disconnected }

    pub fn is_reading(&self) -> bool { self.reading.load(Ordering::Relaxed) }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> { self.socket.set_nodelay(on) }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> { self.socket.set_keepalive(on) }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.on_connection.borrow_mut() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.borrow_mut() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.borrow_mut() = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        *self.on_high_water_mark.borrow_mut() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.on_close.borrow_mut() = Some(callback);
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        self.assert_in_loop_thread();
        *self.context.borrow_mut() = Some(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.assert_in_loop_thread();
        self.context.borrow_mut().take()
    }

    /// Sends bytes to the peer. Callable from any thread: off the reactor
    /// thread the payload is copied and the write re-posted onto the loop.
    /// Sending on a connection that is no longer connected is dropped.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.reactor.is_in_reactor_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.shared_from_this();
            let owned = data.to_vec();
            self.reactor.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-closes the write side once the output buffer has drained.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.shared_from_this();
            self.reactor.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Closes regardless of buffered output.
    pub fn force_close(&self) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnecting);
            let conn = self.shared_from_this();
            self.reactor.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// [`Self::force_close`] after a grace period.
    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnecting);
            let weak = self.this.clone();
            self.reactor.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resumes readiness-driven reading after [`Self::stop_read`].
    pub fn start_read(&self) {
        let conn = self.shared_from_this();
        self.reactor.run_in_loop(move || conn.start_read_in_loop());
    }

    /// Stops watching the socket for readability; input backpressure for the
    /// peer builds up in the kernel.
    pub fn stop_read(&self) {
        let conn = self.shared_from_this();
        self.reactor.run_in_loop(move || conn.stop_read_in_loop());
    }

    /// Completes the handoff from the accept thread: creates and ties the
    /// channel, enables reading and fires the connected callback. Runs once,
    /// on the owning reactor's thread.
    pub(crate) fn connect_established(&self) {
        self.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let reactor =
            Reactor::current().expect("connection established outside its reactor thread");
        let channel = Channel::new(&reactor, self.socket.as_raw_fd());

        let weak = self.this.clone();
        channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = self.this.clone();
        channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = self.this.clone();
        channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = self.this.clone();
        channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        let tied: Arc<dyn Any + Send + Sync> = self.shared_from_this();
        channel.tie(Arc::downgrade(&tied));

        self.reading.store(true, Ordering::Relaxed);
        channel.enable_reading();
        *self.channel.borrow_mut() = Some(channel);

        self.run_connection_callback();
    }

    /// Final lifecycle step, posted by the server after the connection left
    /// its map. Idempotent with respect to an earlier `handle_close`.
    pub(crate) fn connect_destroyed(&self) {
        self.assert_in_loop_thread();
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnected);
            if let Some(channel) = self.channel.borrow().clone() {
                channel.disable_all();
            }
            self.run_connection_callback();
        }
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.remove();
        }
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.assert_in_loop_thread();
        let read = self.input.borrow_mut().read_fd(self.socket.as_raw_fd());
        match read {
            Ok(0) => self.handle_close(),
            Ok(count) => {
                log::trace!(target: "conn", "`{}` received {count} bytes", self.name);
                let callback = self.on_message.borrow().clone();
                match callback {
                    Some(callback) => {
                        let conn = self.shared_from_this();
                        let mut input = self.input.borrow_mut();
                        callback(&conn, &mut input, receive_time);
                    }
                    // Without a consumer the bytes would pile up forever.
                    None => self.input.borrow_mut().retrieve_all(),
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                log::error!(target: "conn", "`{}` read failed: {err}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.assert_in_loop_thread();
        let channel = self.channel.borrow().clone();
        let Some(channel) = channel else { return };
        if !channel.is_writing() {
            log::trace!(target: "conn", "`{}` is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.borrow_mut();
        match self.socket.send(output.peek()) {
            Ok(written) => {
                output.retrieve(written);
                if output.readable_bytes() == 0 {
                    drop(output);
                    channel.disable_writing();
                    if let Some(callback) = self.on_write_complete.borrow().clone() {
                        let conn = self.shared_from_this();
                        self.reactor.queue_in_loop(move || callback(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => log::error!(target: "conn", "`{}` write failed: {err}", self.name),
        }
    }

    fn handle_close(&self) {
        self.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Disconnected {
            return;
        }
        log::debug!(target: "conn", "`{}` closing from state {state}", self.name);
        self.set_state(ConnState::Disconnected);
        if let Some(channel) = self.channel.borrow().clone() {
            channel.disable_all();
        }
        self.run_connection_callback();
        let callback = self.on_close.borrow().clone();
        if let Some(callback) = callback {
            callback(&self.shared_from_this());
        }
    }

    fn handle_error(&self) {
        let error = match self.socket.take_error() {
            Ok(Some(err)) => err.to_string(),
            Ok(None) => "unknown".into(),
            Err(err) => err.to_string(),
        };
        log::error!(target: "conn", "`{}` socket error: {error}", self.name);
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            log::warn!(target: "conn", "`{}` disconnected, give up writing", self.name);
            return;
        }
        let channel = self.channel.borrow().clone();
        let Some(channel) = channel else {
            log::warn!(target: "conn", "`{}` not yet established, give up writing", self.name);
            return;
        };

        let mut written = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Nothing queued and not subscribed to writability: try the socket
        // directly and only buffer the residue.
        if !channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match self.socket.send(data) {
                Ok(count) => {
                    written = count;
                    remaining = data.len() - count;
                    if remaining == 0 {
                        if let Some(callback) = self.on_write_complete.borrow().clone() {
                            let conn = self.shared_from_this();
                            self.reactor.queue_in_loop(move || callback(&conn));
                        }
                    }
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::error!(target: "conn", "`{}` direct write failed: {err}", self.name);
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output.borrow_mut();
            let buffered = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if buffered + remaining >= mark && buffered < mark {
                if let Some(callback) = self.on_high_water_mark.borrow().clone() {
                    let conn = self.shared_from_this();
                    let size = buffered + remaining;
                    self.reactor.queue_in_loop(move || callback(&conn, size));
                }
            }
            output.append(&data[written..]);
            drop(output);
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.assert_in_loop_thread();
        let writing = self
            .channel
            .borrow()
            .as_ref()
            .map_or(false, |channel| channel.is_writing());
        // With output still in flight the half-close waits for handle_write
        // to drain the last byte.
        if !writing {
            if let Err(err) = self.socket.shutdown(Shutdown::Write) {
                log::error!(target: "conn", "`{}` shutdown failed: {err}", self.name);
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.assert_in_loop_thread();
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.assert_in_loop_thread();
        let channel = self.channel.borrow().clone();
        let Some(channel) = channel else { return };
        if !self.reading.load(Ordering::Relaxed) || !channel.is_reading() {
            channel.enable_reading();
            self.reading.store(true, Ordering::Relaxed);
        }
    }

    fn stop_read_in_loop(&self) {
        self.assert_in_loop_thread();
        let channel = self.channel.borrow().clone();
        let Some(channel) = channel else { return };
        if self.reading.load(Ordering::Relaxed) || channel.is_reading() {
            channel.disable_reading();
            self.reading.store(false, Ordering::Relaxed);
        }
    }

    fn run_connection_callback(&self) {
        let callback = self.on_connection.borrow().clone();
        match callback {
            Some(callback) => callback(&self.shared_from_this()),
            None => log::info!(
                target: "conn",
                "`{}` {} -> {} is {}",
                self.name,
                self.local_addr,
                self.peer_addr,
                if self.connected() { "up" } else { "down" }
            ),
        }
    }

    fn shared_from_this(&self) -> Arc<Connection> {
        self.this
            .upgrade()
            .expect("connection methods run while the connection is alive")
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.reactor.is_in_reactor_thread(),
            "connection state touched outside its reactor thread"
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        log::debug!(
            target: "conn",
            "Connection `{}` dropped in state {}", self.name, self.state()
        );
        debug_assert_eq!(self.state(), ConnState::Disconnected);
    }
}
