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
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::Socket;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    Connection, ConnectionCallback, MessageCallback, WriteCompleteCallback,
};
use crate::pool::ReactorPool;
use crate::reactor::{Controller, Reactor};
use crate::thread::ThreadInitCallback;
use crate::timestamp::Timestamp;

/// Connection registry plus the accept-reactor controller: the slice of
/// server state that a closing connection must reach from its worker thread.
struct ServerShared {
    name: String,
    ip_port: String,
    accept: Controller,
    connections: RefCell<HashMap<String, Arc<Connection>>>,
}

// The registry is touched only on the accept reactor's thread; worker
// threads reach it by posting onto the accept reactor (asserted below).
unsafe impl Send for ServerShared {}
unsafe impl Sync for ServerShared {}

impl ServerShared {
    fn remove_connection_in_loop(&self, conn: &Arc<Connection>) {
        assert!(self.accept.is_in_reactor_thread());
        log::info!(
            target: "server",
            "Server `{}` removes connection `{}`", self.name, conn.name()
        );
        self.connections.borrow_mut().remove(conn.name());
        // The bound task pins the connection across the hop back to its
        // worker reactor.
        let worker = conn.controller().clone();
        let conn = conn.clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}

/// TCP server front end: an [`Acceptor`] on the accept reactor plus a
/// [`ReactorPool`] of workers that own the accepted connections.
///
/// Create it on the accept reactor's thread, wire the callbacks, then call
/// [`Server::start`] and run the accept reactor. Dropping the server tears
/// every live connection down on its own worker and joins the pool.
pub struct Server {
    reactor: Controller,
    acceptor: Rc<Acceptor>,
    pool: ReactorPool,
    shared: Arc<ServerShared>,
    started: AtomicBool,
    next_conn_id: Cell<u64>,
    on_connection: RefCell<Option<ConnectionCallback>>,
    on_message: RefCell<Option<MessageCallback>>,
    on_write_complete: RefCell<Option<WriteCompleteCallback>>,
    thread_init: RefCell<Option<ThreadInitCallback>>,
}

impl Server {
    pub fn new(
        reactor: &Rc<Reactor>,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Rc<Server>> {
        let acceptor = Acceptor::new(reactor, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();
        let server = Rc::new(Server {
            reactor: reactor.controller(),
            acceptor: acceptor.clone(),
            pool: ReactorPool::new(reactor.controller(), name.to_string()),
            shared: Arc::new(ServerShared {
                name: name.to_string(),
                ip_port,
                accept: reactor.controller(),
                connections: RefCell::new(empty!()),
            }),
            started: AtomicBool::new(false),
            next_conn_id: Cell::new(1),
            on_connection: RefCell::new(None),
            on_message: RefCell::new(None),
            on_write_complete: RefCell::new(None),
            thread_init: RefCell::new(None),
        });

        let weak = Rc::downgrade(&server);
        acceptor.set_new_connection_callback(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        });
        Ok(server)
    }

    pub fn name(&self) -> &str { &self.shared.name }

    /// The bound listen address as `ip:port`.
    pub fn ip_port(&self) -> &str { &self.shared.ip_port }

    pub fn local_addr(&self) -> SocketAddr { self.acceptor.local_addr() }

    /// Number of worker reactors; zero serves connections on the accept
    /// reactor itself. Set before [`Server::start`].
    pub fn set_thread_num(&self, count: usize) { self.pool.set_thread_num(count) }

    pub fn set_thread_init_callback(
        &self,
        callback: impl Fn(&Rc<Reactor>) + Send + Sync + 'static,
    ) {
        *self.thread_init.borrow_mut() = Some(Arc::new(callback));
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.on_connection.borrow_mut() = Some(Arc::new(callback));
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&Arc<Connection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.on_message.borrow_mut() = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.on_write_complete.borrow_mut() = Some(Arc::new(callback));
    }

    /// Live connections currently registered. Accept-reactor thread only.
    pub fn connection_count(&self) -> usize {
        assert!(self.reactor.is_in_reactor_thread());
        self.shared.connections.borrow().len()
    }

    /// Boots the worker pool and starts listening. Idempotent; must be
    /// called on the accept reactor's thread.
    pub fn start(&self) -> io::Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.pool.start(self.thread_init.borrow().clone());
            assert!(!self.acceptor.listening());
            self.acceptor.listen()?;
        }
        Ok(())
    }

    fn new_connection(&self, socket: Socket, peer: SocketAddr) {
        assert!(self.reactor.is_in_reactor_thread());
        let worker = self.pool.next_reactor();
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        let conn_name = format!("{}-{}#{id}", self.shared.name, self.shared.ip_port);
        log::info!(
            target: "server",
            "Server `{}` accepts connection `{conn_name}` from {peer}", self.shared.name
        );

        let local = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or_else(|| self.acceptor.local_addr());
        let conn = Connection::new(worker.clone(), conn_name.clone(), socket, local, peer);
        self.shared
            .connections
            .borrow_mut()
            .insert(conn_name, conn.clone());

        if let Some(callback) = self.on_connection.borrow().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = self.on_message.borrow().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = self.on_write_complete.borrow().clone() {
            conn.set_write_complete_callback(callback);
        }
        // The close callback runs on the worker thread; removal hops onto
        // the accept reactor, pinning both the registry and the connection.
        let shared = self.shared.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            let shared = shared.clone();
            let conn = conn.clone();
            let accept = shared.accept.clone();
            accept.run_in_loop(move || shared.remove_connection_in_loop(&conn));
        }));

        worker.run_in_loop(move || conn.connect_established());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        assert!(self.reactor.is_in_reactor_thread());
        log::trace!(target: "server", "Server `{}` destructing", self.shared.name);
        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .borrow_mut()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let worker = conn.controller().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
        // Field order below finishes the teardown: the acceptor leaves the
        // accept reactor, then the pool quits and joins every worker.
    }
}
