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

use crate::logger;
use crate::net::NetListener;
use log::{debug, error, info};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGTTIN, SIGTTOU};
use signal_hook::iterator::Signals;
use std::env;
use std::ffi::OsString;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

// supervision tick
const TICK: Duration = Duration::from_millis(100);

// pause before replacing a crashed worker, to avoid fork storms
const RESPAWN_BACKOFF: Duration = Duration::from_millis(250);

// descriptor the readiness pipe is installed on in worker processes
pub const READY_FD: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
}

/// A spawned worker process plus the pipe it reports readiness on.
pub struct WorkerHandle {
    child: Child,
    ready_pipe: UnixStream,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

struct WorkerRecord {
    handle: WorkerHandle,
    started: Instant,
    generation: u64,
    state: WorkerState,
}

pub type SpawnFn = Box<dyn FnMut(u64) -> io::Result<WorkerHandle> + Send>;

/// Spawn a worker from `command`, wiring up the readiness pipe on a fixed
/// descriptor before exec.
pub fn spawn_with_ready(mut command: Command) -> io::Result<WorkerHandle> {
    let (parent_end, child_end) = UnixStream::pair()?;

    parent_end.set_nonblocking(true)?;

    let child_fd = child_end.as_raw_fd();

    command.env("ZIBAI_READY_FD", READY_FD.to_string());

    // SAFETY: dup2/fcntl are async-signal-safe and child_fd stays open in
    // the parent until after spawn returns
    unsafe {
        command.pre_exec(move || {
            if child_fd == READY_FD {
                // already on the right descriptor; just let it survive exec
                if libc::fcntl(READY_FD, libc::F_SETFD, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(child_fd, READY_FD) < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        });
    }

    let child = command.spawn()?;

    drop(child_end);

    Ok(WorkerHandle {
        child,
        ready_pipe: parent_end,
    })
}

/// Spawn function for production workers: re-exec the current binary with
/// the bound listener descriptors inherited.
pub fn worker_spawn_fn(listeners: &[NetListener]) -> io::Result<SpawnFn> {
    for listener in listeners {
        listener.set_inheritable()?;
    }

    let fds: String = listeners
        .iter()
        .map(|l| l.as_raw_fd().to_string())
        .collect::<Vec<_>>()
        .join(",");

    let exe = env::current_exe()?;
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    Ok(Box::new(move |generation| {
        let mut command = Command::new(&exe);

        command.args(&args);
        command.env("ZIBAI_WORKER", "1");
        command.env("ZIBAI_LISTEN_FDS", &fds);
        command.env("ZIBAI_GENERATION", generation.to_string());

        spawn_with_ready(command)
    }))
}

/// Parent-process worker manager: keeps `desired` workers alive, performs
/// rolling restarts and dynamic resizes, and forwards shutdown signals.
pub struct Supervisor {
    desired: usize,
    generation: u64,
    workers: Vec<WorkerRecord>,
    spawn: SpawnFn,
    listeners: Vec<NetListener>,
    graceful_exit_timeout: Duration,
    rolling: bool,
    any_ready: bool,
    startup_failures: usize,
    pending_spawns: Vec<Instant>,
    fatal: bool,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(desired: usize, spawn: SpawnFn, graceful_exit_timeout: Duration) -> Self {
        assert!(desired >= 1);

        Self {
            desired,
            generation: 1,
            workers: Vec::new(),
            spawn,
            listeners: Vec::new(),
            graceful_exit_timeout,
            rolling: false,
            any_ready: false,
            startup_failures: 0,
            pending_spawns: Vec::new(),
            fatal: false,
            shutting_down: false,
        }
    }

    /// Keep the parent's copies of the shared listening sockets alive for
    /// the supervisor's lifetime; they are closed when shutdown begins so
    /// new connections are refused at the kernel once the last worker
    /// closes its own copies.
    pub fn hold_listeners(&mut self, listeners: Vec<NetListener>) {
        self.listeners = listeners;
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_restarting(&self) -> bool {
        self.rolling
    }

    /// Snapshot of (pid, generation, state) per live worker.
    pub fn workers(&self) -> Vec<(u32, u64, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.handle.pid(), w.generation, w.state))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
            .count()
    }

    pub fn start(&mut self) {
        for _ in 0..self.desired {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let generation = self.generation;

        match (self.spawn)(generation) {
            Ok(handle) => {
                info!(
                    target: logger::PROCESS,
                    "started child process [{}]",
                    handle.pid()
                );

                self.workers.push(WorkerRecord {
                    handle,
                    started: Instant::now(),
                    generation,
                    state: WorkerState::Starting,
                });
            }
            Err(e) => {
                error!("failed to start child process: {}", e);
                self.startup_failures += 1;
                self.pending_spawns.push(Instant::now() + RESPAWN_BACKOFF);
            }
        }
    }

    /// One supervision pass: reap exited workers, collect readiness,
    /// advance a rolling restart, and perform due respawns.
    pub fn tick(&mut self) {
        self.reap();
        self.poll_ready();
        self.tick_rolling();
        self.run_pending_spawns();
        self.check_fatal();
    }

    fn reap(&mut self) {
        let mut i = 0;

        while i < self.workers.len() {
            let status = match self.workers[i].handle.child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => {
                    i += 1;
                    continue;
                }
                Err(e) => {
                    error!("failed to poll child process: {}", e);
                    i += 1;
                    continue;
                }
            };

            let record = self.workers.remove(i);
            let pid = record.handle.pid();

            if record.state == WorkerState::Draining {
                info!(target: logger::PROCESS, "child process [{}] exited", pid);
                continue;
            }

            info!(
                target: logger::PROCESS,
                "child process [{}] died with {}",
                pid,
                status
            );

            if self.shutting_down {
                continue;
            }

            if status.success() {
                // clean exit (request budget reached): replace immediately
                self.pending_spawns.push(Instant::now());
            } else {
                if record.state == WorkerState::Starting {
                    self.startup_failures += 1;
                }

                self.pending_spawns.push(Instant::now() + RESPAWN_BACKOFF);
            }
        }
    }

    fn poll_ready(&mut self) {
        let mut became_ready = false;

        for w in self.workers.iter_mut() {
            if w.state != WorkerState::Starting {
                continue;
            }

            let mut buf = [0u8; 1];

            match w.handle.ready_pipe.read(&mut buf) {
                Ok(n) if n > 0 => {
                    info!(
                        target: logger::PROCESS,
                        "child process [{}] is serving",
                        w.handle.pid()
                    );

                    w.state = WorkerState::Running;
                    became_ready = true;
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("readiness pipe error for [{}]: {}", w.handle.pid(), e);
                }
            }
        }

        if became_ready {
            self.any_ready = true;
            self.startup_failures = 0;
        }
    }

    fn tick_rolling(&mut self) {
        if !self.rolling {
            return;
        }

        let generation = self.generation;

        let has_old = self.workers.iter().any(|w| w.generation < generation);

        if !has_old {
            self.rolling = false;
            info!(
                target: logger::PROCESS,
                "rolling restart complete (generation {})",
                generation
            );
            return;
        }

        let starting = self
            .workers
            .iter()
            .any(|w| w.state == WorkerState::Starting);

        let draining = self
            .workers
            .iter()
            .any(|w| w.generation < generation && w.state == WorkerState::Draining);

        // one step at a time: spawn a new-generation worker, wait until it
        // serves, terminate one old worker, wait until it exits
        if starting || draining {
            return;
        }

        if self.workers.len() < self.desired + 1 {
            self.spawn_worker();
            return;
        }

        let oldest = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.generation < generation)
            .min_by_key(|(_, w)| w.started)
            .map(|(i, _)| i);

        if let Some(i) = oldest {
            self.terminate(i);
        }
    }

    fn run_pending_spawns(&mut self) {
        let now = Instant::now();

        let mut due = 0;
        self.pending_spawns.retain(|t| {
            if *t <= now {
                due += 1;
                false
            } else {
                true
            }
        });

        for _ in 0..due {
            if self.workers.len() < self.desired {
                self.spawn_worker();
            }
        }
    }

    fn check_fatal(&mut self) {
        if !self.any_ready && !self.shutting_down && self.startup_failures >= self.desired {
            error!(
                target: logger::ERROR,
                "FATAL: all {} worker slots crashed during startup",
                self.desired
            );

            self.fatal = true;
        }
    }

    fn terminate(&mut self, i: usize) {
        let w = &mut self.workers[i];

        kill(w.handle.pid(), SIGTERM);
        w.state = WorkerState::Draining;

        info!(
            target: logger::PROCESS,
            "terminated child process [{}]",
            w.handle.pid()
        );
    }

    /// Rolling restart: advance the generation and swap workers one at a
    /// time, keeping at least `desired - 1` workers serving throughout.
    pub fn begin_rolling_restart(&mut self) {
        if self.rolling {
            debug!("restart already in progress");
            return;
        }

        info!(target: logger::PROCESS, "restarting worker processes");

        self.generation += 1;
        self.rolling = true;
    }

    pub fn increase_workers(&mut self) {
        self.desired += 1;

        info!(
            target: logger::PROCESS,
            "increasing workers to {}",
            self.desired
        );

        self.spawn_worker();
    }

    pub fn decrease_workers(&mut self) {
        if self.desired <= 1 {
            info!(target: logger::PROCESS, "cannot decrease workers any more");
            return;
        }

        self.desired -= 1;

        info!(
            target: logger::PROCESS,
            "decreasing workers to {}",
            self.desired
        );

        // retire the newest worker that is not already on its way out
        let newest = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state != WorkerState::Draining)
            .max_by_key(|(_, w)| w.started)
            .map(|(i, _)| i);

        if let Some(i) = newest {
            self.terminate(i);
        }
    }

    /// Forward a shutdown signal to every worker and wait for them to
    /// exit: SIGINT for a quick exit, SIGTERM for a graceful drain. The
    /// workers drain in parallel, so one drain deadline bounds the whole
    /// shutdown.
    pub fn shutdown(&mut self, quick: bool, mut signals: Option<&mut Signals>) -> i32 {
        self.shutting_down = true;

        for listener in &self.listeners {
            info!(
                target: logger::PROCESS,
                "stopped listening on {}",
                listener.local_display()
            );
        }

        self.listeners.clear();

        let sig = if quick { SIGINT } else { SIGTERM };

        for w in &self.workers {
            kill(w.handle.pid(), sig);
        }

        let deadline = Instant::now() + self.graceful_exit_timeout;

        while !self.workers.is_empty() && Instant::now() < deadline {
            // a repeated shutdown signal exits immediately
            if let Some(signals) = &mut signals {
                for sig in signals.pending() {
                    if sig == SIGINT || sig == SIGTERM {
                        std::process::exit(0);
                    }
                }
            }

            self.reap();
            thread::sleep(Duration::from_millis(50));
        }

        for w in &mut self.workers {
            let pid = w.handle.pid();
            error!("child process [{}] did not exit, killing", pid);
            let _ = w.handle.child.kill();
            let _ = w.handle.child.wait();
        }

        self.workers.clear();

        0
    }

    /// Supervision loop: consume queued signals and reload edges, keep
    /// workers alive, and return the process exit code.
    pub fn mainloop(
        &mut self,
        signals: &mut Signals,
        reload_rx: Option<&mpsc::Receiver<()>>,
    ) -> i32 {
        info!(
            target: logger::PROCESS,
            "started parent process [{}]",
            std::process::id()
        );

        self.start();

        loop {
            thread::sleep(TICK);

            let pending: Vec<i32> = signals.pending().collect();

            for sig in pending {
                match sig {
                    SIGHUP => self.begin_rolling_restart(),
                    SIGTTIN => self.increase_workers(),
                    SIGTTOU => self.decrease_workers(),
                    SIGINT | SIGTERM => {
                        let code = self.shutdown(sig == SIGINT, Some(signals));

                        info!(
                            target: logger::PROCESS,
                            "stopped parent process [{}]",
                            std::process::id()
                        );

                        return code;
                    }
                    _ => {}
                }
            }

            if let Some(rx) = reload_rx {
                if rx.try_recv().is_ok() {
                    info!(target: logger::PROCESS, "reload requested, restarting workers");
                    self.begin_rolling_restart();
                }
            }

            self.tick();

            if self.fatal {
                self.shutdown(false, Some(signals));
                return 1;
            }
        }
    }
}

fn kill(pid: u32, sig: i32) {
    // SAFETY: sending a signal to a pid we spawned
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// The standard signal set a supervisor listens on.
pub fn supervisor_signals() -> io::Result<Signals> {
    Signals::new([SIGHUP, SIGTTIN, SIGTTOU, SIGINT, SIGTERM])
}
