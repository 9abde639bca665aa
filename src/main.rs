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

use clap::Parser;
use log::{error, info};
use std::env;
use std::process;
use std::sync::mpsc;
use zibai::cliargs::CliArgs;
use zibai::config::{self, Options};
use zibai::demo;
use zibai::logger;
use zibai::reloader::Reloader;
use zibai::resolver::Resolver;
use zibai::supervisor::{self, Supervisor};
use zibai::worker::{self, Hooks};

fn resolve_hooks(resolver: &dyn Resolver, options: &Options) -> Result<Hooks, String> {
    let mut hooks = Hooks::default();

    if let Some(spec) = &options.before_serve {
        hooks.before_serve = Some(resolver.resolve_hook(spec).map_err(|e| e.to_string())?);
    }

    if let Some(spec) = &options.before_graceful_exit {
        hooks.before_graceful_exit =
            Some(resolver.resolve_hook(spec).map_err(|e| e.to_string())?);
    }

    if let Some(spec) = &options.before_died {
        hooks.before_died = Some(resolver.resolve_hook(spec).map_err(|e| e.to_string())?);
    }

    Ok(hooks)
}

fn main() {
    let args = CliArgs::parse();

    logger::ensure_init_simple_logger(args.no_access_log, false);
    logger::local_offset_check();

    let options = match Options::new(&args) {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let registry = demo::default_registry();

    // resolve the application and hooks up front so configuration errors
    // are fatal before any process is forked
    let app = match registry.resolve_app(&options.app, options.call) {
        Ok(app) => app,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let hooks = match resolve_hooks(&registry, &options) {
        Ok(hooks) => hooks,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let is_worker = env::var_os("ZIBAI_WORKER").is_some();

    if is_worker {
        let listeners = match config::listeners_from_env() {
            Ok(listeners) => listeners,
            Err(e) => {
                error!("failed to inherit listen sockets: {}", e);
                process::exit(1);
            }
        };

        if let Err(e) = worker::run(listeners, app, hooks, &options) {
            error!("{}", e);
            process::exit(1);
        }

        return;
    }

    let listeners = match options.bind_listeners() {
        Ok(listeners) => listeners,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    for listener in &listeners {
        info!(
            target: logger::PROCESS,
            "listening on {}",
            listener.local_display()
        );
    }

    if options.subprocess > 0 {
        drop(app);
        drop(hooks);

        let mut signals = match supervisor::supervisor_signals() {
            Ok(signals) => signals,
            Err(e) => {
                error!("failed to install signal handlers: {}", e);
                process::exit(1);
            }
        };

        let reload = match &options.watchfiles {
            Some(patterns) => {
                let (tx, rx) = mpsc::channel();

                match Reloader::start(patterns, tx) {
                    Ok(reloader) => Some((reloader, rx)),
                    Err(e) => {
                        error!("failed to watch files: {}", e);
                        process::exit(1);
                    }
                }
            }
            None => None,
        };

        let spawn = match supervisor::worker_spawn_fn(&listeners) {
            Ok(spawn) => spawn,
            Err(e) => {
                error!("failed to prepare worker spawning: {}", e);
                process::exit(1);
            }
        };

        let mut supervisor = Supervisor::new(
            options.subprocess,
            spawn,
            options.graceful_exit_timeout,
        );

        supervisor.hold_listeners(listeners);

        let code = supervisor.mainloop(&mut signals, reload.as_ref().map(|(_, rx)| rx));

        process::exit(code);
    }

    info!(
        target: logger::PROCESS,
        "run in single process mode [{}]",
        process::id()
    );

    if let Err(e) = worker::run(listeners, app, hooks, &options) {
        error!("{}", e);
        process::exit(1);
    }
}
