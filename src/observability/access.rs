//! Access log formatting and emission.
//!
//! # Responsibilities
//! - Compile the `%(x)s` field template once at startup
//! - Render one line per completed request
//! - Write lines on a dedicated task so the request path never blocks
//! - Report sink failures once, then rate-limit further reports
//!
//! # Template fields
//! `h` remote host, `l` ident, `u` user, `t` CLF timestamp, `r` request
//! line, `m` method, `U` path, `q` query string, `H` protocol, `s` status,
//! `b` bytes or `-`, `B` bytes, `f` referrer, `a` user agent, `T` seconds,
//! `D` microseconds, `L` decimal seconds, `p` process id.

use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Minimum spacing between reports of a failing sink.
const FAILURE_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// One completed request, as seen by the access log.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub remote_addr: IpAddr,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub protocol: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Local>,
    pub pid: u32,
}

impl RequestEvent {
    /// The reconstructed request line, e.g. `GET /health HTTP/1.1`.
    fn request_line(&self) -> String {
        match &self.query {
            Some(q) => format!("{} {}?{} {}", self.method, self.path, q, self.protocol),
            None => format!("{} {} {}", self.method, self.path, self.protocol),
        }
    }
}

/// Error type for template compilation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown field '%({0})s'")]
    UnknownField(char),
    #[error("unterminated field specifier")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    RemoteAddr,
    Ident,
    User,
    Time,
    RequestLine,
    Method,
    Path,
    Query,
    Protocol,
    Status,
    BytesOrDash,
    Bytes,
    Referrer,
    UserAgent,
    Seconds,
    Micros,
    DecimalSeconds,
    Pid,
}

impl Field {
    fn from_specifier(c: char) -> Option<Self> {
        Some(match c {
            'h' => Field::RemoteAddr,
            'l' => Field::Ident,
            'u' => Field::User,
            't' => Field::Time,
            'r' => Field::RequestLine,
            'm' => Field::Method,
            'U' => Field::Path,
            'q' => Field::Query,
            'H' => Field::Protocol,
            's' => Field::Status,
            'b' => Field::BytesOrDash,
            'B' => Field::Bytes,
            'f' => Field::Referrer,
            'a' => Field::UserAgent,
            'T' => Field::Seconds,
            'D' => Field::Micros,
            'L' => Field::DecimalSeconds,
            'p' => Field::Pid,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Literal(String),
    Field(Field),
}

/// A compiled access log template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessFormat {
    chunks: Vec<Chunk>,
}

impl AccessFormat {
    /// Compile a `%(x)s` template. Unknown fields are rejected so a typo
    /// surfaces at startup instead of as garbage in the log.
    pub fn compile(template: &str) -> Result<Self, FormatError> {
        let mut chunks = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.peek() {
                // "%%" is a literal percent sign.
                Some('%') => {
                    chars.next();
                    literal.push('%');
                }
                Some('(') => {
                    chars.next();
                    let spec = chars.next().ok_or(FormatError::Unterminated)?;
                    if chars.next() != Some(')') || chars.next() != Some('s') {
                        return Err(FormatError::Unterminated);
                    }
                    let field =
                        Field::from_specifier(spec).ok_or(FormatError::UnknownField(spec))?;
                    if !literal.is_empty() {
                        chunks.push(Chunk::Literal(std::mem::take(&mut literal)));
                    }
                    chunks.push(Chunk::Field(field));
                }
                _ => literal.push('%'),
            }
        }
        if !literal.is_empty() {
            chunks.push(Chunk::Literal(literal));
        }

        Ok(Self { chunks })
    }

    /// Render one event with this template.
    pub fn render(&self, event: &RequestEvent) -> String {
        let mut line = String::new();
        for chunk in &self.chunks {
            match chunk {
                Chunk::Literal(text) => line.push_str(text),
                Chunk::Field(field) => Self::render_field(&mut line, *field, event),
            }
        }
        line
    }

    fn render_field(line: &mut String, field: Field, event: &RequestEvent) {
        use std::fmt::Write;

        match field {
            Field::RemoteAddr => {
                let _ = write!(line, "{}", event.remote_addr);
            }
            Field::Ident | Field::User => line.push('-'),
            Field::Time => {
                let _ = write!(line, "{}", event.timestamp.format("[%d/%b/%Y:%H:%M:%S %z]"));
            }
            Field::RequestLine => line.push_str(&event.request_line()),
            Field::Method => line.push_str(&event.method),
            Field::Path => line.push_str(&event.path),
            Field::Query => {
                if let Some(q) = &event.query {
                    line.push_str(q);
                }
            }
            Field::Protocol => line.push_str(&event.protocol),
            Field::Status => {
                let _ = write!(line, "{}", event.status);
            }
            Field::BytesOrDash => {
                if event.bytes_sent == 0 {
                    line.push('-');
                } else {
                    let _ = write!(line, "{}", event.bytes_sent);
                }
            }
            Field::Bytes => {
                let _ = write!(line, "{}", event.bytes_sent);
            }
            Field::Referrer => line.push_str(event.referrer.as_deref().unwrap_or("-")),
            Field::UserAgent => line.push_str(event.user_agent.as_deref().unwrap_or("-")),
            Field::Seconds => {
                let _ = write!(line, "{}", event.duration.as_secs());
            }
            Field::Micros => {
                let _ = write!(line, "{}", event.duration.as_micros());
            }
            Field::DecimalSeconds => {
                let _ = write!(line, "{:.6}", event.duration.as_secs_f64());
            }
            Field::Pid => {
                let _ = write!(line, "<{}>", event.pid);
            }
        }
    }
}

enum Sink {
    Stdout(tokio::io::Stdout),
    File(tokio::fs::File),
}

impl Sink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Sink::Stdout(out) => {
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await
            }
            Sink::File(file) => {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
        }
    }
}

/// Handle for recording access events.
///
/// Rendering happens on the caller; the write happens on a dedicated task fed
/// through an unbounded channel, so `record` never blocks and a slow or
/// broken sink cannot stall request handling.
#[derive(Debug, Clone)]
pub struct AccessLogger {
    format: AccessFormat,
    tx: mpsc::UnboundedSender<String>,
}

impl AccessLogger {
    /// Build the logger for the configured sink, or `None` when access
    /// logging is disabled. Must be called from within a runtime.
    pub fn from_config(
        sink: Option<&str>,
        template: &str,
    ) -> io::Result<Option<Self>> {
        let Some(sink) = sink else {
            return Ok(None);
        };

        let format = AccessFormat::compile(template)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let sink = if sink == "-" {
            Sink::Stdout(tokio::io::stdout())
        } else {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(sink)?;
            Sink::File(tokio::fs::File::from_std(file))
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(sink, rx));

        Ok(Some(Self { format, tx }))
    }

    /// Queue one request record. Best-effort: if the writer task is gone the
    /// line is dropped silently.
    pub fn record(&self, event: &RequestEvent) {
        let _ = self.tx.send(self.format.render(event));
    }
}

async fn writer_loop(mut sink: Sink, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut last_report: Option<Instant> = None;
    let mut suppressed: u64 = 0;

    while let Some(line) = rx.recv().await {
        match sink.write_line(&line).await {
            Ok(()) => {}
            Err(e) => {
                let due = last_report
                    .map(|at| at.elapsed() >= FAILURE_REPORT_INTERVAL)
                    .unwrap_or(true);
                if due {
                    tracing::error!(
                        error = %e,
                        suppressed,
                        "Access log write failed"
                    );
                    last_report = Some(Instant::now());
                    suppressed = 0;
                } else {
                    suppressed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DEFAULT_ACCESS_LOG_FORMAT;

    fn sample_event() -> RequestEvent {
        RequestEvent {
            remote_addr: "10.0.0.1".parse().unwrap(),
            method: "GET".into(),
            path: "/health".into(),
            query: None,
            protocol: "HTTP/1.1".into(),
            status: 200,
            bytes_sent: 12,
            referrer: None,
            user_agent: Some("curl/8.5.0".into()),
            duration: Duration::from_micros(1534),
            timestamp: Local::now(),
            pid: 4242,
        }
    }

    #[test]
    fn default_template_compiles() {
        AccessFormat::compile(DEFAULT_ACCESS_LOG_FORMAT).unwrap();
    }

    #[test]
    fn default_template_renders_field_for_field() {
        let event = sample_event();
        let format = AccessFormat::compile(DEFAULT_ACCESS_LOG_FORMAT).unwrap();

        let expected = format!(
            "10.0.0.1 - - {} \"GET /health HTTP/1.1\" 200 12 \"-\" \"curl/8.5.0\" 1534",
            event.timestamp.format("[%d/%b/%Y:%H:%M:%S %z]"),
        );
        assert_eq!(format.render(&event), expected);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert_eq!(
            AccessFormat::compile("%(Z)s"),
            Err(FormatError::UnknownField('Z'))
        );
    }

    #[test]
    fn unterminated_field_is_rejected() {
        assert_eq!(AccessFormat::compile("%(h"), Err(FormatError::Unterminated));
        assert_eq!(AccessFormat::compile("%(h)x"), Err(FormatError::Unterminated));
    }

    #[test]
    fn percent_escapes_and_literals_pass_through() {
        let format = AccessFormat::compile("cpu=100%% status=%(s)s").unwrap();
        let line = format.render(&sample_event());
        assert_eq!(line, "cpu=100% status=200");
    }

    #[test]
    fn zero_bytes_renders_dash_for_b_but_not_big_b() {
        let mut event = sample_event();
        event.bytes_sent = 0;
        let format = AccessFormat::compile("%(b)s %(B)s").unwrap();
        assert_eq!(format.render(&event), "- 0");
    }

    #[test]
    fn query_and_request_line_include_query_string() {
        let mut event = sample_event();
        event.query = Some("verbose=1".into());
        let format = AccessFormat::compile("%(q)s \"%(r)s\"").unwrap();
        assert_eq!(
            format.render(&event),
            "verbose=1 \"GET /health?verbose=1 HTTP/1.1\""
        );
    }

    #[test]
    fn pid_is_bracketed() {
        let format = AccessFormat::compile("%(p)s").unwrap();
        assert_eq!(format.render(&sample_event()), "<4242>");
    }

    #[tokio::test]
    async fn file_sink_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        let logger = AccessLogger::from_config(
            Some(path.to_str().unwrap()),
            "%(m)s %(U)s %(s)s",
        )
        .unwrap()
        .unwrap();

        logger.record(&sample_event());

        // The writer runs on its own task; poll until it has flushed.
        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if !content.is_empty() {
                break;
            }
        }
        assert_eq!(content, "GET /health 200\n");
    }
}
