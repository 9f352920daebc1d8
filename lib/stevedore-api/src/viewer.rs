//! Support for `GET /logs`: building the ephemeral Route the viewer
//! endpoint subscribes with, and formatting the Messages it receives
//! as either colorized plain text or JSON lines.

use std::cell::RefCell;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use stevedore_core::{
    generate_id, is_multi_container, Adapter, ConfigError, Message, Route, RouteFilter, Sink,
    Source,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// The Adapter contract requires a boxed `Adapter` at construction
/// time, but the viewer never hands its Route to a drain task: it
/// calls `PumpSupervisor::route` directly and reads the sink itself.
/// This stands in for the adapter slot so `Route::new`'s signature
/// doesn't need a viewer-specific constructor.
pub struct NoopAdapter;

#[async_trait]
impl Adapter for NoopAdapter {
    async fn stream(self: Box<Self>, _sink: Sink) {}
}

/// Parses the path segment after `/logs` (already stripped of its
/// leading `/`) into a filter: `""` matches everything, `id:{prefix}`
/// and `name:{glob}` narrow to one dimension.
pub fn parse_path_filter(tail: &str) -> Result<RouteFilter, ConfigError> {
    let tail = tail.trim_start_matches('/');
    if tail.is_empty() {
        return Ok(RouteFilter::default());
    }
    if let Some(prefix) = tail.strip_prefix("id:") {
        return Ok(RouteFilter {
            filter_id: Some(prefix.to_string()),
            ..Default::default()
        });
    }
    if let Some(glob) = tail.strip_prefix("name:") {
        return Ok(RouteFilter {
            filter_name: Some(glob.to_string()),
            ..Default::default()
        });
    }
    Err(ConfigError::BadFilter {
        reason: format!("unrecognized /logs path segment {tail:?}, expected id:<prefix> or name:<glob>"),
    })
}

/// Parses the `sources` query parameter (comma-separated `stdout`/`stderr`).
pub fn parse_sources(csv: Option<&String>) -> Result<Vec<Source>, ConfigError> {
    match csv {
        None => Ok(Vec::new()),
        Some(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<Source>().map_err(|_| ConfigError::BadFilter {
                    reason: format!("unknown source {s:?} in sources query param"),
                })
            })
            .collect(),
    }
}

/// Builds the ephemeral, unpersisted Route the viewer attaches to the
/// Pump Supervisor with. Its id is cosmetic (it never appears in the
/// registry or the store).
pub fn ephemeral_route(filter: RouteFilter) -> Arc<Route> {
    Arc::new(Route::new(
        format!("viewer-{}", generate_id()),
        filter,
        "viewer".to_string(),
        None,
        "http".to_string(),
        HashMap::new(),
        Box::new(NoopAdapter),
    ))
}

/// One of up to 14 rotating ANSI colors assigned per container.
const ANSI_COLORS: &[u8] = &[31, 32, 33, 34, 35, 36, 91, 92, 93, 94, 95, 96, 97, 90];

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colorized when more than one container can match; plain otherwise.
    Text { colorize: bool },
    JsonLines,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    container_id: &'a str,
    container_name: &'a str,
    source: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    message: &'a str,
}

/// Formats Messages for one viewer connection. Holds a per-connection
/// color assignment table; never shared across connections or
/// threads concurrently, so the `RefCell` never observes concurrent
/// borrows.
pub struct Formatter {
    format: OutputFormat,
    colors: RefCell<HashMap<String, u8>>,
    next_color: RefCell<usize>,
}

impl Formatter {
    pub fn new(filter: &RouteFilter, json: bool) -> Self {
        let format = if json {
            OutputFormat::JsonLines
        } else {
            OutputFormat::Text {
                colorize: is_multi_container(filter),
            }
        };
        Formatter {
            format,
            colors: RefCell::new(HashMap::new()),
            next_color: RefCell::new(0),
        }
    }

    fn color_for(&self, container_id: &str) -> u8 {
        if let Some(color) = self.colors.borrow().get(container_id) {
            return *color;
        }
        let mut next = self.next_color.borrow_mut();
        let color = ANSI_COLORS[*next % ANSI_COLORS.len()];
        *next += 1;
        self.colors.borrow_mut().insert(container_id.to_string(), color);
        color
    }

    pub fn format(&self, msg: &Message) -> Bytes {
        match self.format {
            OutputFormat::JsonLines => {
                let record = JsonRecord {
                    container_id: msg.container.short_id(),
                    container_name: msg.container.normal_name(),
                    source: msg.source.as_str(),
                    timestamp: msg.timestamp,
                    message: &msg.payload,
                };
                let mut line = serde_json::to_vec(&record).unwrap_or_default();
                line.push(b'\n');
                Bytes::from(line)
            }
            OutputFormat::Text { colorize } => {
                let line = if colorize {
                    let color = self.color_for(&msg.container.id);
                    format!(
                        "\x1b[{}m{}\x1b[0m|{}\n",
                        color,
                        msg.container.normal_name(),
                        msg.payload
                    )
                } else {
                    format!("{}\n", msg.payload)
                };
                Bytes::from(line)
            }
        }
    }
}

/// Adapts the viewer's sink-receiving half into a `Stream<Item =
/// Result<Bytes, Infallible>>` suitable for a streaming HTTP response
/// body, formatting each Message as it arrives. Cancels the ephemeral
/// Route when dropped, which is hyper's signal for "the client
/// disconnected and the response body will never be polled again" —
/// this is what makes the viewer stream end, and the ephemeral Route
/// get cancelled, exactly when the client goes away.
pub struct ViewerBody {
    inner: ReceiverStream<Message>,
    formatter: Formatter,
    route: Arc<Route>,
}

impl ViewerBody {
    pub fn new(rx: mpsc::Receiver<Message>, formatter: Formatter, route: Arc<Route>) -> Self {
        ViewerBody {
            inner: ReceiverStream::new(rx),
            formatter,
            route,
        }
    }
}

impl Stream for ViewerBody {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(Ok(this.formatter.format(&msg)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ViewerBody {
    fn drop(&mut self) {
        self.route.cancel();
    }
}
