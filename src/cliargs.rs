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

use clap::{ArgAction, Parser};

#[derive(Parser, Clone, Debug)]
#[command(
    name = "zibai",
    version,
    about = "HTTP/1.1 gateway application server."
)]
pub struct CliArgs {
    #[arg(value_name = "module:attribute", help = "Gateway application to serve.")]
    pub app: String,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Call the resolved attribute with no arguments to obtain the application."
    )]
    pub call: bool,

    #[arg(
        long,
        short = 'l',
        value_name = "HOST:PORT|unix:PATH",
        action = ArgAction::Append,
        help = "Listen address (repeatable, default: 127.0.0.1:8000)."
    )]
    pub listen: Vec<String>,

    #[arg(
        long,
        short = 'p',
        value_name = "N",
        default_value = "0",
        help = "Number of worker subprocesses (0 = run in the foreground)."
    )]
    pub subprocess: usize,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Force the threaded worker pool."
    )]
    pub no_gevent: bool,

    #[arg(
        long,
        short = 'w',
        value_name = "N",
        default_value = "10",
        help = "Maximum number of concurrent handlers per worker."
    )]
    pub max_workers: usize,

    #[arg(
        long,
        value_name = "patterns",
        help = "Watch files matching the semicolon-separated glob list and restart workers on changes."
    )]
    pub watchfiles: Option<String>,

    #[arg(long, value_name = "N", help = "Listen backlog.")]
    pub backlog: Option<i32>,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Bind ipv4 and ipv6 on one socket."
    )]
    pub dualstack_ipv6: bool,

    #[arg(
        long,
        value_name = "octal",
        default_value = "600",
        help = "Permissions for unix sockets."
    )]
    pub unix_socket_perms: String,

    #[arg(
        long = "h11-max-incomplete-event-size",
        value_name = "N",
        help = "Maximum number of bytes in an incomplete protocol event."
    )]
    pub h11_max_incomplete_event_size: Option<usize>,

    #[arg(
        long,
        value_name = "N",
        help = "Maximum number of requests to process before draining the worker."
    )]
    pub max_request_pre_process: Option<u64>,

    #[arg(
        long,
        value_name = "seconds",
        default_value = "10",
        help = "Drain deadline on graceful exit."
    )]
    pub graceful_exit_timeout: f64,

    #[arg(
        long,
        value_name = "scheme",
        default_value = "http",
        help = "Url scheme passed to the application as wsgi.url_scheme."
    )]
    pub url_scheme: String,

    #[arg(
        long,
        value_name = "prefix",
        help = "Url prefix passed to the application as SCRIPT_NAME; defaults to the SCRIPT_NAME environment variable."
    )]
    pub url_prefix: Option<String>,

    #[arg(
        long,
        value_name = "module:attribute",
        help = "Callback to run before serving requests."
    )]
    pub before_serve: Option<String>,

    #[arg(
        long,
        value_name = "module:attribute",
        help = "Callback to run before graceful exit."
    )]
    pub before_graceful_exit: Option<String>,

    #[arg(
        long,
        value_name = "module:attribute",
        help = "Callback to run before exiting."
    )]
    pub before_died: Option<String>,

    #[arg(long, action = ArgAction::SetTrue, help = "Disable the access log.")]
    pub no_access_log: bool,
}
