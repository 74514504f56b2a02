//! End-to-end server scenarios over real loopback sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netreactor::{Connection, Reactor, Server};

fn any_local_addr() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn echo_round_trip_and_removal() {
    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "echo", false).unwrap();
    server.set_thread_num(1);

    let messages = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let seen = messages.clone();
    server.set_message_callback(move |conn, buffer, _when| {
        let data = buffer.retrieve_all_as_string();
        seen.lock().unwrap().push(data.clone().into_bytes());
        conn.send(data.as_bytes());
    });
    let disconnects = Arc::new(AtomicUsize::new(0));
    let down = disconnects.clone();
    server.set_connection_callback(move |conn| {
        if conn.disconnected() {
            down.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let controller = reactor.controller();
    let observed_down = disconnects.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello\n").unwrap();
        let mut reply = [0u8; 6];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello\n");
        drop(stream);
        assert!(wait_until(Duration::from_secs(5), || {
            observed_down.load(Ordering::SeqCst) == 1
        }));
        // Give the removal hop onto the accept reactor time to land.
        thread::sleep(Duration::from_millis(100));
        controller.quit();
    });
    reactor.run();
    client.join().unwrap();

    assert_eq!(*messages.lock().unwrap(), vec![b"hello\n".to_vec()]);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn single_loop_server_echoes() {
    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "echo0", false).unwrap();
    // Zero workers: connections are served by the accept reactor itself.
    server.set_thread_num(0);
    server.set_message_callback(|conn, buffer, _when| {
        let data = buffer.retrieve_all_as_string();
        conn.send(data.as_bytes());
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let controller = reactor.controller();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
        controller.quit();
    });
    reactor.run();
    client.join().unwrap();
}

#[test]
fn high_water_mark_fires_exactly_once_per_crossing() {
    const MARK: usize = 1024;
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "hwm", false).unwrap();
    server.set_thread_num(1);

    let hits = Arc::new(AtomicUsize::new(0));
    let sizes = Arc::new(Mutex::new(Vec::<usize>::new()));
    let observed_hits = hits.clone();
    let observed_sizes = sizes.clone();
    server.set_connection_callback(move |conn| {
        if !conn.connected() {
            return;
        }
        let hits = observed_hits.clone();
        let sizes = observed_sizes.clone();
        conn.set_high_water_mark_callback(
            Arc::new(move |_conn, size| {
                hits.fetch_add(1, Ordering::SeqCst);
                sizes.lock().unwrap().push(size);
            }),
            MARK,
        );
        // The peer never reads: the direct write consumes what the kernel
        // accepts and the rest is buffered, crossing the mark once.
        conn.send(&vec![b'x'; PAYLOAD]);
        // Already above the mark: this append must not fire again.
        conn.send(&vec![b'y'; 2 * MARK]);
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let controller = reactor.controller();
    let observed = hits.clone();
    let client = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            observed.load(Ordering::SeqCst) >= 1
        }));
        // Linger unread long enough for a spurious second fire to show up.
        thread::sleep(Duration::from_millis(200));
        drop(stream);
        controller.quit();
    });
    reactor.run();
    client.join().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let sizes = sizes.lock().unwrap();
    assert!(sizes[0] >= MARK);
}

#[test]
fn shutdown_drains_buffered_output_before_eof() {
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "drain", false).unwrap();
    server.set_thread_num(1);
    server.set_connection_callback(|conn| {
        if conn.connected() {
            let payload: Vec<u8> = (0..PAYLOAD).map(|i| i as u8).collect();
            conn.send(&payload);
            // Residue is still buffered; the write-half must close only
            // after the final byte is flushed.
            conn.shutdown();
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let controller = reactor.controller();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), PAYLOAD);
        assert!(received
            .iter()
            .enumerate()
            .all(|(i, &byte)| byte == i as u8));
        controller.quit();
    });
    reactor.run();
    client.join().unwrap();
}

#[test]
fn cross_thread_send_is_fifo() {
    const ROUNDS: usize = 50;

    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "fifo", false).unwrap();
    server.set_thread_num(1);

    let slot = Arc::new(Mutex::new(None::<Arc<Connection>>));
    let publish = slot.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            *publish.lock().unwrap() = Some(conn.clone());
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    // A plain thread, not a reactor thread: every send must hop onto the
    // worker loop and still arrive in posting order.
    let sender_slot = slot.clone();
    let sender = thread::spawn(move || {
        assert!(wait_until(Duration::from_secs(5), || {
            sender_slot.lock().unwrap().is_some()
        }));
        let conn = sender_slot.lock().unwrap().clone().unwrap();
        for i in 0..ROUNDS {
            conn.send(format!("msg-{i:03};").as_bytes());
        }
    });

    let controller = reactor.controller();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let expected: String = (0..ROUNDS).map(|i| format!("msg-{i:03};")).collect();
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
        controller.quit();
    });
    reactor.run();
    sender.join().unwrap();
    client.join().unwrap();
}

#[test]
fn server_drop_destroys_every_connection_on_its_worker() {
    const CLIENTS: usize = 3;

    let reactor = Reactor::new();
    let server = Server::new(&reactor, any_local_addr(), "teardown", false).unwrap();
    server.set_thread_num(3);

    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let up_count = ups.clone();
    let down_count = downs.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            up_count.fetch_add(1, Ordering::SeqCst);
        } else {
            down_count.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let controller = reactor.controller();
    let observed_ups = ups.clone();
    let clients = thread::spawn(move || {
        let streams: Vec<TcpStream> =
            (0..CLIENTS).map(|_| TcpStream::connect(addr).unwrap()).collect();
        assert!(wait_until(Duration::from_secs(5), || {
            observed_ups.load(Ordering::SeqCst) == CLIENTS
        }));
        controller.quit();
        streams
    });
    reactor.run();
    let streams = clients.join().unwrap();

    // Dropping the server posts connect_destroyed onto each worker and
    // joins the pool; every connection must report its down transition
    // before the destructor returns.
    drop(server);
    assert_eq!(downs.load(Ordering::SeqCst), CLIENTS);

    // Workers are joined: nothing may fire afterwards.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(downs.load(Ordering::SeqCst), CLIENTS);
    drop(streams);
}
