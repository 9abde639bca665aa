/*
 * Copyright (C) 2024-2025 the Zibai authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::connection::{handle_connection, ServeContext};
use crate::logger;
use crate::net::{NetListener, NetStream, PeerAddr};
use log::{debug, error, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use slab::Slab;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// how often the accept loop rechecks the graceful-exit flag
const ACCEPT_POLL: Duration = Duration::from_millis(100);

type Job = (NetStream, PeerAddr, (String, u16));

/// Accept connections from the listeners and multiplex them over a bounded
/// set of handler threads. Blocks until draining completes.
///
/// Dispatch uses a rendezvous channel: when every handler is busy the send
/// blocks, which pauses accepting (backpressure of depth 0-1). On the
/// graceful-exit edge the listeners are closed first, then in-flight
/// handlers get up to `graceful_exit_timeout` to finish before their
/// sockets are shut down.
pub fn run(
    listeners: Vec<NetListener>,
    ctx: ServeContext,
    max_workers: usize,
    graceful_exit_timeout: Duration,
) -> io::Result<()> {
    assert!(max_workers >= 1);

    let graceful = Arc::clone(&ctx.graceful);

    let conns: Arc<Mutex<Slab<NetStream>>> = Arc::new(Mutex::new(Slab::new()));
    let active = Arc::new((Mutex::new(0usize), Condvar::new()));

    let (tx, rx) = mpsc::sync_channel::<Job>(0);
    let rx = Arc::new(Mutex::new(rx));

    let mut threads = Vec::with_capacity(max_workers);

    for _ in 0..max_workers {
        let rx = Arc::clone(&rx);
        let conns = Arc::clone(&conns);
        let active = Arc::clone(&active);
        let ctx = ctx.clone();

        threads.push(thread::spawn(move || loop {
            let job = {
                let rx = rx.lock().unwrap();
                rx.recv()
            };

            let (stream, peer, server) = match job {
                Ok(job) => job,
                Err(_) => break,
            };

            let key = match stream.try_clone() {
                Ok(clone) => Some(conns.lock().unwrap().insert(clone)),
                Err(_) => None,
            };

            {
                let (lock, _) = &*active;
                *lock.lock().unwrap() += 1;
            }

            handle_connection(&ctx, stream, peer, server);

            if let Some(key) = key {
                let mut conns = conns.lock().unwrap();

                if conns.contains(key) {
                    conns.remove(key);
                }
            }

            {
                let (lock, cvar) = &*active;
                *lock.lock().unwrap() -= 1;
                cvar.notify_all();
            }
        }));
    }

    let mut poll = mio::Poll::new()?;

    let mut server_addrs = Vec::with_capacity(listeners.len());

    for (i, listener) in listeners.iter().enumerate() {
        listener.set_nonblocking(true)?;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(listener);
        poll.registry()
            .register(&mut SourceFd(&fd), Token(i), Interest::READABLE)?;

        server_addrs.push(listener.server_addr());
    }

    let mut events = Events::with_capacity(64);
    let mut readable = vec![true; listeners.len()];

    'accept: loop {
        if graceful.load(Ordering::SeqCst) {
            break;
        }

        for i in 0..listeners.len() {
            while readable[i] {
                if graceful.load(Ordering::SeqCst) {
                    break 'accept;
                }

                match listeners[i].accept() {
                    Ok((stream, peer)) => {
                        debug!(target: logger::DEBUG, "accepted connection from {}", peer);

                        let _ = stream.set_nonblocking(false);

                        if tx.send((stream, peer, server_addrs[i].clone())).is_err() {
                            break 'accept;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        readable[i] = false;
                    }
                    Err(e) => {
                        error!("accept error: {:?}", e);
                    }
                }
            }
        }

        match poll.poll(&mut events, Some(ACCEPT_POLL)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            readable[event.token().0] = true;
        }
    }

    // drain: close the listeners before anything else so new connections
    // are refused at the kernel
    drop(poll);

    for listener in &listeners {
        info!(
            target: logger::PROCESS,
            "stopped listening on {}",
            listener.local_display()
        );
    }

    drop(listeners);

    // idle handlers exit once the queue disconnects; busy ones observe the
    // graceful flag between exchanges
    drop(tx);

    let (lock, cvar) = &*active;
    let mut active_count = lock.lock().unwrap();
    let deadline = Instant::now() + graceful_exit_timeout;

    while *active_count > 0 {
        let now = Instant::now();

        if now >= deadline {
            break;
        }

        let (guard, _) = cvar.wait_timeout(active_count, deadline - now).unwrap();
        active_count = guard;
    }

    let remaining = *active_count;
    drop(active_count);

    if remaining > 0 {
        warn!(
            "graceful exit timeout reached, closing {} remaining connections",
            remaining
        );

        let conns = conns.lock().unwrap();

        for (_, stream) in conns.iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    for thread in threads {
        let _ = thread.join();
    }

    Ok(())
}
