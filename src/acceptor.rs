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

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::Channel;
use crate::reactor::Reactor;
use crate::sys;

/// Receives each accepted connection as an owned, non-blocking socket plus
/// the peer address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Listens on a bound socket inside the accept reactor and emits one
/// callback per accepted connection.
///
/// Construction binds; [`Acceptor::listen`] enters the kernel listen state
/// and turns readability on. Both the constructor and every callback run on
/// the accept reactor's thread.
pub struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    listening: Cell<bool>,
    /// Pre-opened placeholder descriptor sacrificed to accept-and-close when
    /// the process runs out of descriptors, so the listening socket does not
    /// spin readable forever.
    idle_fd: Cell<i32>,
    on_connection: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        reactor: &Rc<Reactor>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Rc<Acceptor>> {
        reactor.assert_in_loop_thread();
        let socket = Socket::new(Domain::for_address(listen_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(&listen_addr.into())?;
        let idle_fd = sys::open_idle_fd()?;

        let channel = Channel::new(reactor, socket.as_raw_fd());
        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            listening: Cell::new(false),
            idle_fd: Cell::new(idle_fd),
            on_connection: RefCell::new(None),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, callback: impl FnMut(Socket, SocketAddr) + 'static) {
        *self.on_connection.borrow_mut() = Some(Box::new(callback));
    }

    /// The address the socket is actually bound to (resolves a port-0 bind).
    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .expect("listening socket must have an inet address")
    }

    pub fn listening(&self) -> bool { self.listening.get() }

    /// Enters the kernel listen state and starts watching for readability.
    /// Must be called on the accept reactor's thread.
    pub fn listen(&self) -> io::Result<()> {
        self.listening.set(true);
        self.socket.listen(libc::SOMAXCONN)?;
        self.channel.enable_reading();
        log::info!(target: "acceptor", "Listening on {}", self.local_addr());
        Ok(())
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((connection, peer)) => {
                let peer = peer
                    .as_socket()
                    .expect("accepted TCP connection without an inet address");
                if let Err(err) = connection.set_nonblocking(true) {
                    log::error!(target: "acceptor", "Cannot make accepted socket non-blocking: {err}");
                }
                match self.on_connection.borrow_mut().as_mut() {
                    Some(callback) => callback(connection, peer),
                    // Nobody wants it; dropping closes the descriptor.
                    None => drop(connection),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::trace!(target: "acceptor", "Spurious accept readiness");
            }
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                log::error!(target: "acceptor", "Out of file descriptors, shedding one connection");
                sys::close_fd(self.idle_fd.get());
                let drained = unsafe {
                    libc::accept(self.socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
                };
                if drained >= 0 {
                    sys::close_fd(drained);
                }
                match sys::open_idle_fd() {
                    Ok(fd) => self.idle_fd.set(fd),
                    Err(err) => {
                        log::error!(target: "acceptor", "Cannot reopen placeholder fd: {err}")
                    }
                }
            }
            Err(err) => log::error!(target: "acceptor", "Accept failed: {err}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        sys::close_fd(self.idle_fd.get());
    }
}
