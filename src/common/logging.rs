// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process logging.
//!
//! Events are written one per line in glog layout,
//! `Lyyyymmdd hh:mm:ss.uuuuuu tid file:line] {span fields} message`, to a log file when one
//! can be opened and to stderr otherwise.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormattedFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

/// Where log lines go.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogDestination {
    File(PathBuf),
    Stderr,
}

impl LogDestination {
    /// `$FRAGEXEC_LOG_FILE`, else `fragexec.log` under `$FRAGEXEC_LOG_DIR`, `$LOG_DIR` or `log/`.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(file) = non_empty("FRAGEXEC_LOG_FILE") {
            return LogDestination::File(PathBuf::from(file));
        }
        let dir = non_empty("FRAGEXEC_LOG_DIR")
            .or_else(|| non_empty("LOG_DIR"))
            .unwrap_or_else(|| "log".to_string());
        LogDestination::File(PathBuf::from(dir).join("fragexec.log"))
    }
}

#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl SharedFile {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(SharedFile(Arc::new(Mutex::new(file))))
    }
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

struct GlogFormatter;

fn level_char(level: &tracing::Level) -> char {
    match *level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

fn thread_id() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse::<u64>()
        .unwrap_or(0)
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_char(metadata.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_id(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0)
        )?;

        // Fields of enclosing spans, outermost first, e.g. `{fragment=...:1:0} `.
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{}}} ", fields)?;
                }
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber once. `filter` is an `EnvFilter` expression.
pub fn init_with_level(filter: &str) {
    init_with_destination(filter, LogDestination::from_env());
}

pub fn init_with_destination(filter: &str, destination: LogDestination) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::new(filter);
        let file = match &destination {
            LogDestination::File(path) => match SharedFile::open(path) {
                Ok(file) => Some(file),
                Err(err) => {
                    eprintln!(
                        "failed to open log file {}: {}, fallback to stderr",
                        path.display(),
                        err
                    );
                    None
                }
            },
            LogDestination::Stderr => None,
        };

        // `with_ansi` is only available before the event format is replaced.
        let builder = tracing_fmt().with_env_filter(env_filter);
        let _ = match file {
            Some(file) => builder
                .with_writer(file)
                .with_ansi(false)
                .event_format(GlogFormatter)
                .try_init(),
            // ANSI only on a terminal; redirected stderr would show raw escape codes.
            None => builder
                .with_writer(io::stderr)
                .with_ansi(atty::is(atty::Stream::Stderr))
                .event_format(GlogFormatter)
                .try_init(),
        };
    });
}

pub fn init() {
    init_with_level("info");
}

/// Initialize logging from the loaded config, falling back to `info` without one.
pub fn init_from_config() {
    match crate::common::app_config::config() {
        Ok(cfg) => init_with_level(cfg.effective_log_filter()),
        Err(_) => init(),
    }
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};
