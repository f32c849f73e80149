use std::{
    collections::HashMap,
    fs::OpenOptions,
    path::PathBuf,
};
use nu_ansi_term::{Color, Style};
use serde::Deserialize;
use termcolor::ColorChoice;
use tracing::{field::Visit, Level};
use tracing_log::NormalizeEvent;
use tracing_subscriber::{
    filter::{FilterFn, LevelFilter},
    fmt::FormatEvent,
    prelude::*,
};

use crate::{prelude::*, args::Args, telemetry::{self, TelemetryConfig}};


#[derive(Debug, confique::Config)]
pub(crate) struct LogConfig {
    /// Specifies what log messages to emit, based on the module path and log level.
    ///
    /// This is a map where the key specifies a module path prefix, and the
    /// value specifies a minimum log level. For each log message, the map
    /// entry with the longest prefix matching the log's module path is chosen.
    /// If no such entry exists, the log is not emitted. Otherwise, that
    /// entry's level is used to check whether the log message should be
    /// emitted.
    ///
    /// Example: the following config allows ≥"info" messages from postgraph
    /// generally, ≥"trace" messages from the `db` module (which logs all SQL
    /// queries), and ≥"debug" messages from the `tokio_postgres` dependency.
    ///
    ///    [log]
    ///    filters.postgraph = "info"
    ///    filters."postgraph::db" = "trace"
    ///    filters.tokio_postgres = "debug"
    ///
    /// These filters also apply to the spans exported via OTLP.
    #[config(default = { "postgraph": "debug" })]
    pub(crate) filters: Filters,

    /// If this is set, log messages are also written to this file. The string
    /// `${cmd}` in this value is replaced by the subcommand name of the
    /// postgraph process, e.g. `serve`, `db` or `other`. Example:
    /// "/var/log/postgraph-${cmd}.log".
    pub(crate) file: Option<PathBuf>,

    /// If this is set to `false`, log messages are not written to stdout.
    #[config(default = true)]
    pub(crate) stdout: bool,

    /// If set to `true`, HTTP header of each incoming request are logged
    /// (with 'trace' level).
    #[config(default = false)]
    pub(crate) log_http_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "HashMap<String, String>")]
pub(crate) struct Filters(HashMap<String, LevelFilter>);

impl TryFrom<HashMap<String, String>> for Filters {
    type Error = String;
    fn try_from(value: HashMap<String, String>) -> Result<Self, Self::Error> {
        value.into_iter()
            .map(|(target_prefix, level)| Ok((target_prefix, parse_level_filter(&level)?)))
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl Filters {
    /// Whether a message with the given target and level passes the filter.
    /// The entry with the longest matching prefix decides.
    fn allows(&self, target: &str, level: &Level) -> bool {
        self.0.iter()
            .filter(|(target_prefix, _)| target.starts_with(target_prefix.as_str()))
            .max_by_key(|(target_prefix, _)| target_prefix.len())
            .is_some_and(|(_, level_filter)| level <= level_filter)
    }

    fn max_level(&self) -> LevelFilter {
        self.0.values().max().copied().unwrap_or(LevelFilter::OFF)
    }
}

fn parse_level_filter(s: &str) -> Result<LevelFilter, String> {
    match s {
        "off" => Ok(LevelFilter::OFF),
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        other => Err(format!("invalid log level '{other}'")),
    }
}

/// Installs our own logger globally, including the OTLP span export if
/// configured. Must only be called once!
pub(crate) fn init(
    config: &LogConfig,
    telemetry: &TelemetryConfig,
    args: &Args,
    cmd: &str,
) -> Result<()> {
    let filter = {
        let filters = config.filters.clone();
        let max_level = filters.max_level();
        FilterFn::new(move |metadata| filters.allows(metadata.target(), metadata.level()))
            .with_max_level_hint(max_level)
    };

    macro_rules! subscriber {
        ($writer:expr, $color:expr) => {
            tracing_subscriber::fmt::layer()
                .event_format(EventFormatter($color))
                .with_writer($writer)
        };
    }

    let stdout_output = config.stdout
        .then(|| subscriber!(std::io::stdout, args.stdout_color()));

    let file_output = config.file.as_ref()
        .map(|path| -> Result<std::fs::File> {
            use std::io::Write;

            let new_path = path.to_str()
                .ok_or_else(|| anyhow!("log file path is not valid UTF-8"))?
                .replace("${cmd}", cmd);

            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(new_path)
                .with_context(|| format!("failed to open/create log file '{}'", path.display()))?;

            // Add an empty line separator to see process restarts easier.
            file.write_all(b"\n").context("could not write to log file")?;

            Ok(file)
        })
        .transpose()?
        .map(|file| {
            let color: ColorChoice = args.color.into();
            subscriber!(file, color).with_ansi(color == ColorChoice::Always)
        });

    let otel_output = telemetry::tracing_layer(telemetry)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_output)
        .with(file_output)
        .with(stdout_output)
        .init();

    if telemetry.jaeger_exporter {
        info!("Exporting spans to Jaeger at '{}'", telemetry.jaeger_endpoint);
    }
    if telemetry.lightstep_exporter {
        info!("Exporting spans to Lightstep at '{}'", telemetry.lightstep_endpoint);
    }

    Ok(())
}

type TracingWriter<'a> = tracing_subscriber::fmt::format::Writer<'a>;

#[derive(Clone, Copy)]
struct EventFormatter(ColorChoice);

/// Fields that are not printed: the message is printed separately, the others
/// are meta information for other consumers.
fn ignore_field(name: &str) -> bool {
    name == "message"
        || name.starts_with("log.")
        || name.starts_with("otel.")
        || name.starts_with("postgraph.")
}

impl<S, N> FormatEvent<S, N> for EventFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: TracingWriter<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let use_ansi = self.0 == ColorChoice::Always
            || (writer.has_ansi_escapes() && self.0 != ColorChoice::Never);
        macro_rules! wr {
            ($style:expr, $fmt:literal $($args:tt)*) => {{
                with_style(&mut writer, use_ansi, $style, |w| {
                    write!(w, $fmt $($args)*)
                })?;
            }};
        }

        // Events coming from the `log` crate carry their real metadata in
        // fields.
        let normalized_metadata = event.normalized_metadata();
        let metadata = normalized_metadata.as_ref().unwrap_or(event.metadata());

        let dim_style = Style::new().dimmed();
        let level_style = match *metadata.level() {
            Level::ERROR => Style::new().fg(Color::Red).bold(),
            Level::WARN => Style::new().fg(Color::Yellow).bold(),
            Level::INFO => Style::new().fg(Color::Green),
            Level::DEBUG => Style::new().fg(Color::Blue),
            Level::TRACE => Style::new().fg(Color::Magenta),
        };
        let body_style = match *metadata.level() {
            Level::ERROR => Style::new().fg(Color::Red),
            Level::WARN => Style::new().fg(Color::Yellow),
            Level::INFO => Style::new(),
            Level::DEBUG => Style::new().dimmed(),
            Level::TRACE => Style::new().fg(Color::DarkGray),
        };

        // Time, level, target and the names of all spans we are in, e.g.
        // `http_request:graphql:Post.findMany`.
        let spans = ctx.event_scope()
            .map(|scope| scope.from_root().map(|span| span.name()).collect::<Vec<_>>().join(":"))
            .unwrap_or_default();
        wr!(dim_style, "{} ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S.%3f"));
        wr!(level_style, "{:5}", metadata.level());
        wr!(dim_style, " {}", metadata.target());
        if !spans.is_empty() {
            wr!(dim_style.italic(), " [{spans}]");
        }
        wr!(dim_style, " >  ");


        // ---- Message & fields ---------------------------------------------
        // We print fields ourselves instead of via `FormatFields` as the style
        // depends on the level, which is not accessible there.

        #[derive(Debug)]
        struct SummaryVisitor {
            message: Option<String>,
            // Print each field on its own line.
            multiline: bool,
            num_fields: u32,
        }

        impl Visit for SummaryVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if !ignore_field(field.name()) {
                    self.num_fields += 1;
                }

                if field.name() == "message" {
                    self.message = Some(format!("{value:?}"));
                }
            }

            fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
                if !ignore_field(field.name()) {
                    self.num_fields += 1;
                }

                // `postgraph.multiline = true` prints each field on its own line.
                if field.name() == "postgraph.multiline" {
                    self.multiline = value;
                }
            }
        }

        let mut summary = SummaryVisitor {
            message: None,
            multiline: false,
            num_fields: 0,
        };
        event.record(&mut summary);


        struct PrintContext<'a> {
            prefix: &'a str,
            use_ansi: bool,
            body_style: Style,
        }

        fn print_multiline(
            s: &str,
            out: &mut TracingWriter<'_>,
            ctx: &PrintContext<'_>,
        ) -> std::fmt::Result {
            let mut lines = s.lines();
            with_style(out, ctx.use_ansi, ctx.body_style, |out| {
                write!(out, "{}", lines.next().unwrap_or(""))
            })?;

            for line in lines {
                write!(out, "{}", ctx.prefix)?;
                with_style(out, ctx.use_ansi, ctx.body_style, |out| write!(out, "{line}"))?;
            }

            Ok(())
        }

        struct Printer<'a, 'w> {
            buffer: String,
            ctx: PrintContext<'a>,
            multiline: bool,
            separator: &'a str,
            needs_separator: bool,
            out: TracingWriter<'w>,
        }

        impl Printer<'_, '_> {
            fn print_field(&mut self, name: &str) -> std::fmt::Result {
                if self.needs_separator {
                    write!(self.out, "{}", self.separator)?;
                }

                let key_style = self.ctx.body_style.italic();
                with_style(&mut self.out, self.ctx.use_ansi, key_style, |out| {
                    write!(out, "{name}")
                })?;
                with_style(&mut self.out, self.ctx.use_ansi, self.ctx.body_style, |out| {
                    write!(out, "{}", if self.multiline { " = " } else { "=" })
                })?;

                if self.multiline {
                    print_multiline(&self.buffer, &mut self.out, &self.ctx)?;
                } else {
                    let (buffer, style) = (&self.buffer, self.ctx.body_style);
                    with_style(&mut self.out, self.ctx.use_ansi, style, |out| {
                        write!(out, "{buffer}")
                    })?;
                }
                self.needs_separator = true;
                Ok(())
            }
        }

        impl Visit for Printer<'_, '_> {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if ignore_field(field.name()) {
                    return;
                }

                use std::fmt::Write;
                self.buffer.clear();
                let _ = write!(self.buffer, "{value:?}");
                let _ = self.print_field(field.name());
            }
        }


        // The padded prefix to align continuation lines with the message.
        // Only correct for ASCII targets, which ours are.
        let prefix = {
            let mut padding = "2021-05-04 19:40:18.270 DEBUG ".len() + 2 + metadata.target().len();
            if !spans.is_empty() {
                padding += spans.len() + 3;
            }
            format!(
                "\n{:padding$}{prefix}>{suffix}  ",
                "",
                padding = padding - 1,
                prefix = if use_ansi { dim_style.prefix() } else { Style::new().prefix() },
                suffix = if use_ansi { dim_style.suffix() } else { Style::new().suffix() },
            )
        };

        let print_ctx = PrintContext {
            prefix: &prefix,
            use_ansi,
            body_style,
        };

        if let Some(msg) = &summary.message {
            print_multiline(msg, &mut writer, &print_ctx)?;
        }

        if summary.num_fields > 0 {
            if summary.message.is_some() {
                wr!(level_style, " ~~ ");
            }
            let mut printer = Printer {
                separator: if summary.multiline { &prefix } else { " " },
                needs_separator: summary.multiline && summary.message.is_some(),
                ctx: print_ctx,
                multiline: summary.multiline,
                out: writer.by_ref(),
                // Reuse the string from before as scratch buffer
                buffer: summary.message.unwrap_or_default(),
            };
            event.record(&mut printer);
        }

        writeln!(writer, "{}", if use_ansi { nu_ansi_term::ansi::RESET } else { "" })?;

        Ok(())
    }
}

fn with_style(
    out: &mut TracingWriter<'_>,
    use_ansi: bool,
    style: Style,
    f: impl FnOnce(&mut TracingWriter<'_>) -> std::fmt::Result,
) -> std::fmt::Result {
    if use_ansi {
        write!(out, "{}", style.prefix())?;
    }
    f(out)?;
    if use_ansi {
        write!(out, "{}", style.suffix())?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use tracing::Level;
    use tracing_subscriber::filter::LevelFilter;

    use super::{Filters, ignore_field, parse_level_filter};

    fn filters(entries: &[(&str, &str)]) -> Filters {
        let map = entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Filters::try_from(map).unwrap()
    }

    #[test]
    fn levels() {
        assert_eq!(parse_level_filter("off"), Ok(LevelFilter::OFF));
        assert_eq!(parse_level_filter("warn"), Ok(LevelFilter::WARN));
        assert!(parse_level_filter("verbose").is_err());
        assert!(Filters::try_from(HashMap::from([("a".to_owned(), "loud".to_owned())])).is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let f = filters(&[
            ("postgraph", "info"),
            ("postgraph::db", "trace"),
            ("postgraph::db::cmd", "off"),
        ]);

        assert!(f.allows("postgraph::http", &Level::INFO));
        assert!(!f.allows("postgraph::http", &Level::DEBUG));
        assert!(f.allows("postgraph::db::conn", &Level::TRACE));
        assert!(!f.allows("postgraph::db::cmd", &Level::ERROR));
        assert!(!f.allows("hyper::proto", &Level::ERROR));
        assert_eq!(f.max_level(), LevelFilter::TRACE);
    }

    #[test]
    fn meta_fields_are_not_printed() {
        assert!(ignore_field("message"));
        assert!(ignore_field("otel.name"));
        assert!(ignore_field("postgraph.multiline"));
        assert!(!ignore_field("db.model"));
    }
}
