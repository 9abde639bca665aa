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

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::str;
use std::sync::OnceLock;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Process lifecycle records: start/stop/fork/reap.
pub const PROCESS: &str = "zibai";

/// Connection-level tracing.
pub const DEBUG: &str = "zibai::debug";

/// One record per successful exchange.
pub const ACCESS: &str = "zibai::access";

/// Protocol, application and exchange failures.
pub const ERROR: &str = "zibai::error";

static LOCAL_OFFSET: OnceLock<Option<UtcOffset>> = OnceLock::new();

// Obtains the local offset and caches it forever. This call may fail if
// there are multiple threads running when it is called for the first time,
// so it should be called early in the program before spawning threads.
fn local_offset() -> Option<UtcOffset> {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().ok())
}

pub fn local_offset_check() {
    if local_offset().is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}

pub struct SimpleLogger {
    no_access_log: bool,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.no_access_log && record.target() == ACCESS && record.level() >= Level::Info {
            return;
        }

        let now = OffsetDateTime::now_utc().to_offset(local_offset().unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .expect("failed to write timestamp");

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).expect("timestamp is not utf-8");

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        // error-sink records go to stderr, everything else to stdout
        if record.target() == ERROR {
            let stderr = io::stderr();
            writeln!(stderr.lock(), "[{}] {} {}", lname, ts, record.args())
                .expect("failed to write log output");
            return;
        }

        let stdout = io::stdout();
        let mut stdout = stdout.lock();

        if record.level() <= log::Level::Info {
            writeln!(stdout, "[{}] {} {}", lname, ts, record.args())
                .expect("failed to write log output");
        } else {
            writeln!(
                stdout,
                "[{}] {} [{}] {}",
                lname,
                ts,
                record.target(),
                record.args()
            )
            .expect("failed to write log output");
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(no_access_log: bool, verbose: bool) {
    let logger = LOGGER.get_or_init(|| SimpleLogger { no_access_log });

    if log::set_logger(logger).is_ok() {
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

/// Structured fields attached to access/error records: the full request
/// environment plus the exchange outcome. Sinks that understand key/values
/// can pick any field; the default sink prints the message line only.
pub struct ExchangeFields<'a> {
    pub environ_vars: &'a [(String, String)],
    pub status: u16,
    pub bytes_sent: u64,
    pub duration_ms: u64,
}

impl log::kv::Source for ExchangeFields<'_> {
    fn visit<'kvs>(
        &'kvs self,
        visitor: &mut dyn log::kv::VisitSource<'kvs>,
    ) -> Result<(), log::kv::Error> {
        for (key, value) in self.environ_vars {
            visitor.visit_pair(
                log::kv::Key::from_str(key),
                log::kv::Value::from(value.as_str()),
            )?;
        }

        visitor.visit_pair(log::kv::Key::from_str("status"), self.status.into())?;
        visitor.visit_pair(log::kv::Key::from_str("bytes_sent"), self.bytes_sent.into())?;
        visitor.visit_pair(
            log::kv::Key::from_str("duration_ms"),
            self.duration_ms.into(),
        )?;

        Ok(())
    }
}

/// Emit the per-exchange record: access sink for successful exchanges with
/// status < 500, error sink otherwise.
pub fn log_exchange(
    method: &str,
    path: &str,
    protocol: &str,
    failed: bool,
    fields: &ExchangeFields<'_>,
) {
    let (target, level) = if failed || fields.status >= 500 {
        (ERROR, Level::Error)
    } else {
        (ACCESS, Level::Info)
    };

    log::logger().log(
        &Record::builder()
            .level(level)
            .target(target)
            .key_values(fields)
            .args(format_args!(
                "\"{} {} {}\" {}",
                method, path, protocol, fields.status
            ))
            .build(),
    );
}
