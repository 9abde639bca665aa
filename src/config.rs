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

use crate::cliargs::CliArgs;
use crate::net::{ListenSpec, NetListener};
use std::env;
use std::error::Error;
use std::time::Duration;

/// Normalized server configuration derived from the CLI surface.
#[derive(Debug, Clone)]
pub struct Options {
    pub app: String,
    pub call: bool,
    pub listen: Vec<ListenSpec>,
    pub subprocess: usize,
    pub no_gevent: bool,
    pub max_workers: usize,
    pub watchfiles: Option<String>,
    pub backlog: Option<i32>,
    pub max_incomplete_event_size: Option<usize>,
    pub max_request_pre_process: Option<u64>,
    pub graceful_exit_timeout: Duration,
    pub url_scheme: String,
    pub url_prefix: String,
    pub before_serve: Option<String>,
    pub before_graceful_exit: Option<String>,
    pub before_died: Option<String>,
    pub no_access_log: bool,
}

impl Options {
    pub fn new(args: &CliArgs) -> Result<Self, Box<dyn Error>> {
        if args.max_workers < 1 {
            return Err("max-workers must be greater than or equal to 1".into());
        }

        let unix_socket_perms = match u32::from_str_radix(&args.unix_socket_perms, 8) {
            Ok(x) => x,
            Err(_) => return Err("unix-socket-perms must be an octal integer".into()),
        };

        let listen_values: Vec<&str> = if args.listen.is_empty() {
            vec!["127.0.0.1:8000"]
        } else {
            args.listen.iter().map(|s| s.as_str()).collect()
        };

        let mut listen = Vec::with_capacity(listen_values.len());

        for value in listen_values {
            listen.push(ListenSpec::parse(
                value,
                args.dualstack_ipv6,
                unix_socket_perms,
            )?);
        }

        // watching files only makes sense with a supervisor in charge
        let subprocess = if args.watchfiles.is_some() {
            args.subprocess.max(1)
        } else {
            args.subprocess
        };

        if !args.graceful_exit_timeout.is_finite() || args.graceful_exit_timeout < 0.0 {
            return Err("graceful-exit-timeout must be a non-negative number".into());
        }

        let url_prefix = match &args.url_prefix {
            Some(prefix) => prefix.clone(),
            None => env::var("SCRIPT_NAME").unwrap_or_default(),
        };

        Ok(Self {
            app: args.app.clone(),
            call: args.call,
            listen,
            subprocess,
            no_gevent: args.no_gevent,
            max_workers: args.max_workers,
            watchfiles: args.watchfiles.clone(),
            backlog: args.backlog,
            max_incomplete_event_size: args.h11_max_incomplete_event_size,
            max_request_pre_process: args.max_request_pre_process,
            graceful_exit_timeout: Duration::from_secs_f64(args.graceful_exit_timeout),
            url_scheme: args.url_scheme.clone(),
            url_prefix,
            before_serve: args.before_serve.clone(),
            before_graceful_exit: args.before_graceful_exit.clone(),
            before_died: args.before_died.clone(),
            no_access_log: args.no_access_log,
        })
    }

    pub fn bind_listeners(&self) -> Result<Vec<NetListener>, Box<dyn Error>> {
        let mut listeners = Vec::with_capacity(self.listen.len());

        for spec in &self.listen {
            listeners.push(spec.bind(self.backlog)?);
        }

        Ok(listeners)
    }
}

/// Rebuild listeners from descriptors inherited from the supervisor.
pub fn listeners_from_env() -> Result<Vec<NetListener>, Box<dyn Error>> {
    let fds = env::var("ZIBAI_LISTEN_FDS")?;

    let mut listeners = Vec::new();

    for fd in fds.split(',') {
        let fd: i32 = fd
            .trim()
            .parse()
            .map_err(|_| format!("invalid listen fd: {:?}", fd))?;

        listeners.push(NetListener::from_inherited_fd(fd)?);
    }

    if listeners.is_empty() {
        return Err("no inherited listen sockets".into());
    }

    Ok(listeners)
}
