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

use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zibai::supervisor::{spawn_with_ready, SpawnFn, Supervisor, WorkerState};

// a worker that reports readiness on the inherited pipe and then serves
// until signalled
const SERVING: &str = "printf r >&3; exec sleep 30";

fn shell_worker(script: &'static str) -> SpawnFn {
    Box::new(move |_generation| {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);

        spawn_with_ready(command)
    })
}

fn wait_until<F: FnMut(&mut Supervisor) -> bool>(
    supervisor: &mut Supervisor,
    timeout: Duration,
    mut cond: F,
) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        supervisor.tick();

        if cond(supervisor) {
            return true;
        }

        thread::sleep(Duration::from_millis(20));
    }

    false
}

#[test]
fn test_spawn_and_readiness() {
    let mut supervisor = Supervisor::new(2, shell_worker(SERVING), Duration::from_secs(2));

    supervisor.start();
    assert_eq!(supervisor.workers().len(), 2);

    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    assert!(!supervisor.is_fatal());

    assert_eq!(supervisor.shutdown(true, None), 0);
    assert!(supervisor.workers().is_empty());
}

#[test]
fn test_rolling_restart_advances_generations() {
    let mut supervisor = Supervisor::new(2, shell_worker(SERVING), Duration::from_secs(2));

    supervisor.start();
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    let old_pids: Vec<u32> = supervisor.workers().iter().map(|(pid, _, _)| *pid).collect();
    assert!(supervisor
        .workers()
        .iter()
        .all(|(_, generation, _)| *generation == 1));

    supervisor.begin_rolling_restart();
    assert_eq!(supervisor.generation(), 2);

    // swap one worker at a time; never fewer than desired - 1 serving
    let done = wait_until(&mut supervisor, Duration::from_secs(10), |s| {
        assert!(
            s.workers()
                .iter()
                .filter(|(_, _, state)| *state == WorkerState::Running)
                .count()
                >= 1
        );

        !s.is_restarting()
    });
    assert!(done, "rolling restart did not complete");

    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    let new_pids: Vec<u32> = supervisor.workers().iter().map(|(pid, _, _)| *pid).collect();

    assert_eq!(new_pids.len(), 2);
    assert!(supervisor
        .workers()
        .iter()
        .all(|(_, generation, _)| *generation == 2));
    assert!(old_pids.iter().all(|pid| !new_pids.contains(pid)));

    supervisor.shutdown(true, None);
}

#[test]
fn test_resize_up_and_down() {
    let mut supervisor = Supervisor::new(2, shell_worker(SERVING), Duration::from_secs(2));

    supervisor.start();
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    supervisor.increase_workers();
    assert_eq!(supervisor.desired(), 3);
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 3
    }));

    supervisor.decrease_workers();
    assert_eq!(supervisor.desired(), 2);
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.workers().len() == 2
    }));

    supervisor.shutdown(true, None);
}

#[test]
fn test_resize_floor_is_one() {
    let mut supervisor = Supervisor::new(1, shell_worker(SERVING), Duration::from_secs(2));

    supervisor.start();
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 1
    }));

    supervisor.decrease_workers();
    assert_eq!(supervisor.desired(), 1);
    assert_eq!(supervisor.workers().len(), 1);

    supervisor.shutdown(true, None);
}

#[test]
fn test_crashed_worker_is_respawned_with_backoff() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let spawned_in_fn = Arc::clone(&spawned);

    // the first spawn crashes immediately; replacements serve
    let spawn: SpawnFn = Box::new(move |_generation| {
        let n = spawned_in_fn.fetch_add(1, Ordering::SeqCst);

        let script = if n == 0 { "exit 3" } else { SERVING };

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);

        spawn_with_ready(command)
    });

    let mut supervisor = Supervisor::new(2, spawn, Duration::from_secs(2));

    supervisor.start();
    assert_eq!(spawned.load(Ordering::SeqCst), 2);

    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    assert_eq!(spawned.load(Ordering::SeqCst), 3);
    assert!(!supervisor.is_fatal());

    supervisor.shutdown(true, None);
}

#[test]
fn test_startup_crash_loop_is_fatal() {
    let mut supervisor = Supervisor::new(2, shell_worker("exit 3"), Duration::from_secs(2));

    supervisor.start();

    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.is_fatal()
    }));
}

#[test]
fn test_graceful_shutdown_bounded_by_single_timeout() {
    let timeout = Duration::from_secs(1);

    let spawned = Arc::new(AtomicUsize::new(0));
    let spawned_in_fn = Arc::clone(&spawned);

    // the first worker drains promptly on SIGTERM; the second holds its
    // in-flight work past the signal and never exits on its own
    let spawn: SpawnFn = Box::new(move |_generation| {
        let n = spawned_in_fn.fetch_add(1, Ordering::SeqCst);

        let script = if n == 0 {
            SERVING
        } else {
            "printf r >&3; trap '' TERM; sleep 30"
        };

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);

        spawn_with_ready(command)
    });

    let mut supervisor = Supervisor::new(2, spawn, timeout);

    supervisor.start();
    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 2
    }));

    // workers drain in parallel: one shared deadline bounds the whole
    // shutdown, even with a worker that has to be force-killed
    let begin = Instant::now();
    assert_eq!(supervisor.shutdown(false, None), 0);
    let elapsed = begin.elapsed();

    assert!(supervisor.workers().is_empty());
    assert!(
        elapsed < timeout + Duration::from_millis(500),
        "shutdown took {:?}, expected within one drain deadline",
        elapsed
    );
}

#[test]
fn test_clean_exit_is_replaced() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let spawned_in_fn = Arc::clone(&spawned);

    // the first worker reaches its request budget and exits 0
    let spawn: SpawnFn = Box::new(move |_generation| {
        let n = spawned_in_fn.fetch_add(1, Ordering::SeqCst);

        let script = if n == 0 {
            "printf r >&3; exit 0"
        } else {
            SERVING
        };

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);

        spawn_with_ready(command)
    });

    let mut supervisor = Supervisor::new(1, spawn, Duration::from_secs(2));

    supervisor.start();

    assert!(wait_until(&mut supervisor, Duration::from_secs(5), |s| {
        s.running_count() == 1 && spawned.load(Ordering::SeqCst) == 2
    }));

    supervisor.shutdown(true, None);
}
