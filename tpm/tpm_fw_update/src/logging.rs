// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Forwarding of orchestrator events to a caller-installed sink.
//!
//! Every event goes to `tracing` first. When a [`LogSink`] is installed, the
//! same text is also handed to it, optionally prefixed with the seconds since
//! the UNIX epoch.

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::Level;

/// Receives level-tagged text for every orchestrator event.
pub trait LogSink: Send {
    /// Called once per event.
    fn log(&self, level: Level, message: &str);
}

/// The sink currently installed on a session, if any.
#[derive(Default)]
pub struct Logger {
    sink: Option<Box<dyn LogSink>>,
    add_time_stamps: bool,
}

impl Logger {
    /// A logger that forwards to `sink`.
    pub fn new(sink: Box<dyn LogSink>, add_time_stamps: bool) -> Self {
        Self {
            sink: Some(sink),
            add_time_stamps,
        }
    }

    /// Hands one event to the sink.
    pub fn forward(&self, level: Level, args: fmt::Arguments<'_>) {
        let Some(sink) = &self.sink else {
            return;
        };
        if self.add_time_stamps {
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs());
            sink.log(level, &format!("[{seconds}] {args}"));
        } else {
            sink.log(level, &args.to_string());
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.is_some())
            .field("add_time_stamps", &self.add_time_stamps)
            .finish()
    }
}

/// Emits a `tracing` event and forwards the same text to a [`Logger`].
macro_rules! log_event {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        tracing::event!($level, $($arg)+);
        $logger.forward($level, format_args!($($arg)+));
    }};
}

pub(crate) use log_event;
