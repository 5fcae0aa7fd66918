use core::fmt as core_fmt;

use time::{OffsetDateTime, macros::format_description};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{
        FmtContext,
        format::{FormatEvent, FormatFields, Writer},
    },
    registry::LookupSpan,
};

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[1;31m",
        Level::WARN => "\x1b[1;33m",
        Level::INFO => "\x1b[1;32m",
        Level::DEBUG => "\x1b[1;34m",
        Level::TRACE => "\x1b[1;35m",
    }
}

/// Drops the crate prefix from our own targets; `rustacord::voice::gateway`
/// becomes `voice::gateway`.
pub fn short_target(target: &str) -> &str {
    target
        .strip_prefix(concat!(env!("CARGO_CRATE_NAME"), "::"))
        .unwrap_or(target)
}

/// Single-line event format:
/// `[timestamp] LEVEL thread span:span target:line > message`.
///
/// The thread column tells shards (`gateway-shard-N`) apart from the voice
/// runtime's workers.
pub struct ConsoleFormatter {
    use_ansi: bool,
}

impl ConsoleFormatter {
    pub fn new(use_ansi: bool) -> Self {
        Self { use_ansi }
    }

    fn paint(&self, style: &'static str) -> &'static str {
        if self.use_ansi { style } else { "" }
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> core_fmt::Result {
        let (dim, reset) = (self.paint(DIM), self.paint(RESET));

        let timestamp = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        match now.format(&timestamp) {
            Ok(ts) => write!(writer, "{dim}[{ts}]{reset} ")?,
            Err(_) => write!(writer, "{dim}[?]{reset} ")?,
        }

        let metadata = event.metadata();
        let level = metadata.level();
        write!(
            writer,
            "{}{:<5}{} ",
            self.paint(level_color(level)),
            level.as_str(),
            reset
        )?;

        let thread = std::thread::current();
        match thread.name() {
            Some(name) => write!(writer, "{name} ")?,
            None => write!(writer, "{:?} ", thread.id())?,
        }

        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                let sep = if first { "" } else { ":" };
                write!(writer, "{sep}{}", span.name())?;
                first = false;
            }
            if !first {
                write!(writer, " ")?;
            }
        }

        match metadata.line() {
            Some(line) => write!(writer, "{dim}{}:{line}{reset} > ", short_target(metadata.target()))?,
            None => write!(writer, "{dim}{}{reset} > ", short_target(metadata.target()))?,
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer, "{reset}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_targets_lose_the_crate_prefix() {
        assert_eq!(short_target("rustacord::voice::manager"), "voice::manager");
        assert_eq!(short_target("tokio_tungstenite"), "tokio_tungstenite");
    }
}
