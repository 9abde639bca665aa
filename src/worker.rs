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

use crate::config::Options;
use crate::connection::ServeContext;
use crate::gateway::Application;
use crate::logger;
use crate::net::NetListener;
use crate::pool;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

pub type Hook = Box<dyn Fn() -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync>;

/// User-supplied lifecycle callbacks.
#[derive(Default)]
pub struct Hooks {
    pub before_serve: Option<Hook>,
    pub before_graceful_exit: Option<Hook>,
    pub before_died: Option<Hook>,
}

fn run_hook(name: &str, hook: &Option<Hook>) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(hook) = hook {
        if let Err(e) = hook() {
            error!("exception in `{}` callback: {}", name, e);
            return Err(e);
        }
    }

    Ok(())
}

/// Tell the supervisor this worker is serving. No-op when running in the
/// foreground without a supervisor.
fn notify_ready() {
    let fd = match std::env::var("ZIBAI_READY_FD") {
        Ok(value) => match value.parse::<i32>() {
            Ok(fd) => fd,
            Err(_) => return,
        },
        Err(_) => return,
    };

    // SAFETY: the descriptor was installed by the supervisor before exec
    // and belongs to this process
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let _ = pipe.write_all(b"1");
}

/// Host one worker: set signal dispositions, run the lifecycle hooks, and
/// drive the worker pool until drained.
///
/// SIGINT exits immediately with status 0. The first SIGTERM sets the
/// graceful-exit flag; a second SIGTERM exits immediately.
pub fn run(
    listeners: Vec<NetListener>,
    app: Arc<dyn Application>,
    hooks: Hooks,
    options: &Options,
) -> Result<(), Box<dyn Error>> {
    let graceful = Arc::new(AtomicBool::new(false));

    let quick = Arc::new(AtomicBool::new(true));
    signal_hook::flag::register_conditional_shutdown(SIGINT, 0, quick)?;
    signal_hook::flag::register_conditional_shutdown(SIGTERM, 0, Arc::clone(&graceful))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&graceful))?;

    if !options.no_gevent {
        warn!("cooperative runtime not available, using threads for the worker pool");
    }

    // a failed before_serve aborts the worker; the supervisor treats that
    // as a restartable crash
    if run_hook("before_serve", &hooks.before_serve).is_err() {
        return Err("`before_serve` callback failed".into());
    }

    notify_ready();

    for listener in &listeners {
        info!(
            target: logger::PROCESS,
            "accepting requests on {}",
            listener.local_display()
        );
    }

    let ctx = ServeContext {
        app,
        script_name: options.url_prefix.clone(),
        url_scheme: options.url_scheme.clone(),
        multiprocess: options.subprocess > 0,
        graceful,
        requests: Arc::new(AtomicU64::new(0)),
        max_request_pre_process: options.max_request_pre_process,
        max_incomplete_event_size: options.max_incomplete_event_size,
    };

    pool::run(
        listeners,
        ctx,
        options.max_workers,
        options.graceful_exit_timeout,
    )?;

    // drain complete; failures here are logged but do not block exit
    let _ = run_hook("before_graceful_exit", &hooks.before_graceful_exit);
    let _ = run_hook("before_died", &hooks.before_died);

    log::logger().flush();

    Ok(())
}
