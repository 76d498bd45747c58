use quickjs_bridge::config::LoggingConfig;
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

struct RedactingWriter<W> {
    inner: W,
    patterns: Vec<(Regex, String)>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut redacted = String::from_utf8_lossy(buf).into_owned();
        for (re, replacement) in &self.patterns {
            redacted = re.replace_all(&redacted, replacement.as_str()).into_owned();
        }
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Vec<(Regex, String)>,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

fn redaction_patterns(logging: &LoggingConfig) -> Vec<(Regex, String)> {
    if !logging.redaction.enabled {
        return Vec::new();
    }
    logging
        .redaction
        .patterns
        .iter()
        .filter_map(|p| match Regex::new(&p.regex) {
            Ok(re) => Some((re, p.placeholder.clone())),
            Err(e) => {
                eprintln!("warning: skipping redaction pattern '{}': {}", p.name, e);
                None
            }
        })
        .collect()
}

/// Install the stderr subscriber. `RUST_LOG` wins over the configured levels;
/// `--verbose` or `logging.verbose` forces debug.
pub fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose || logging.verbose {
        "debug"
    } else {
        logging.levels.directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let make_writer = RedactingMakeWriter {
        patterns: redaction_patterns(logging),
    };
    let format = &logging.format;

    // Layer::boxed() unifies the if/else branch types
    let fmt_layer = if !format.show_time {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(format.show_target)
            .with_file(format.show_file)
            .with_line_number(format.show_line)
            .without_time()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(format.show_target)
            .with_file(format.show_file)
            .with_line_number(format.show_line)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickjs_bridge::config::RedactionPattern;
    use std::io::Write;

    #[test]
    fn test_redacting_writer_masks_patterns() {
        let mut logging = LoggingConfig::default();
        logging.redaction.patterns = vec![
            RedactionPattern {
                name: "bearer".into(),
                regex: r"(?i)bearer\s+[a-z0-9._-]+".into(),
                placeholder: "Bearer [REDACTED]".into(),
            },
            RedactionPattern {
                name: "broken".into(),
                regex: "(".into(),
                placeholder: "x".into(),
            },
        ];
        let patterns = redaction_patterns(&logging);
        assert_eq!(patterns.len(), 1);

        let mut w = RedactingWriter {
            inner: Vec::new(),
            patterns,
        };
        let line = b"auth: Bearer abc.def-123 ok";
        assert_eq!(w.write(line).unwrap(), line.len());
        assert_eq!(String::from_utf8(w.inner).unwrap(), "auth: Bearer [REDACTED] ok");
    }

    #[test]
    fn test_redaction_disabled() {
        let mut logging = LoggingConfig::default();
        logging.redaction.enabled = false;
        logging.redaction.patterns = vec![RedactionPattern {
            name: "all".into(),
            regex: ".*".into(),
            placeholder: "".into(),
        }];
        assert!(redaction_patterns(&logging).is_empty());
    }
}
