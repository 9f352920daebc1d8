//! The production [`ContainerRuntime`](super::ContainerRuntime),
//! backed by the local Docker daemon via `bollard`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures_util::{stream, StreamExt};
use snafu::ResultExt;

use crate::container::ContainerInfo;
use crate::message::Source;

use super::{ContainerRuntime, FollowOptions, LogLine, RequestSnafu, RuntimeError, RuntimeEvent, RuntimeEventKind};

/// Docker's log API writes one chunk per underlying write syscall, not
/// one chunk per line: a container that writes several lines in one
/// call gets them back concatenated, and a long line can arrive split
/// across chunks. This re-chunks a raw per-source byte stream into
/// discrete, `\n`-terminator-stripped [`LogLine`]s, buffering any
/// trailing partial line per source until more bytes (or stream end)
/// complete it.
struct LineSplitter {
    inner: BoxStream<'static, Result<LogLine, RuntimeError>>,
    buffers: HashMap<Source, Vec<u8>>,
    pending: VecDeque<LogLine>,
    done: bool,
}

impl LineSplitter {
    fn new(inner: BoxStream<'static, Result<LogLine, RuntimeError>>) -> Self {
        LineSplitter {
            inner,
            buffers: HashMap::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn feed(&mut self, source: Source, data: Vec<u8>) {
        let buf = self.buffers.entry(source).or_default();
        buf.extend_from_slice(&data);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.drain(..=pos).collect::<Vec<u8>>();
            self.pending.push_back(LogLine {
                source,
                data: line[..line.len() - 1].to_vec(),
            });
        }
    }

    fn flush_remaining(&mut self) {
        for (&source, buf) in self.buffers.iter_mut() {
            if !buf.is_empty() {
                self.pending.push_back(LogLine {
                    source,
                    data: std::mem::take(buf),
                });
            }
        }
    }

    fn into_stream(self) -> BoxStream<'static, Result<LogLine, RuntimeError>> {
        Box::pin(stream::unfold(self, |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    return Some((Ok(line), state));
                }
                if state.done {
                    return None;
                }
                match state.inner.next().await {
                    Some(Ok(line)) => state.feed(line.source, line.data),
                    Some(Err(err)) => return Some((Err(err), state)),
                    None => {
                        state.done = true;
                        state.flush_remaining();
                    }
                }
            }
        }))
    }
}

/// Wraps a connected `bollard::Docker` client.
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connects using the same defaults the Docker CLI uses:
    /// `DOCKER_HOST` if set, otherwise the local Unix socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().context(RequestSnafu)?;
        Ok(BollardRuntime { docker })
    }
}

fn to_container_info(id: String, inspect: bollard::models::ContainerInspectResponse) -> ContainerInfo {
    let config = inspect.config.unwrap_or_default();
    let host_config = inspect.host_config.unwrap_or_default();
    let state = inspect.state.unwrap_or_default();

    ContainerInfo {
        id,
        name: inspect.name.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        tty: config.tty.unwrap_or(false),
        log_driver: host_config
            .log_config
            .and_then(|lc| lc.typ)
            .unwrap_or_default(),
        running: state.running.unwrap_or(false),
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context(RequestSnafu)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(id) = summary.id {
                containers.push(self.inspect(&id).await?);
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let resp = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|_| RuntimeError::NotFound { id: id.to_string() })?;
        Ok(to_container_info(id.to_string(), resp))
    }

    async fn events(
        &self,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent, RuntimeError>>, RuntimeError> {
        let stream = self
            .docker
            .events(Some(EventsOptions::<String> {
                filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
                ..Default::default()
            }))
            .map(|item| {
                let event = item.map_err(|e| RuntimeError::Request { source: Box::new(e) })?;
                let kind = match event.action.as_deref() {
                    Some("start") => RuntimeEventKind::Start,
                    Some("restart") => RuntimeEventKind::Restart,
                    Some("rename") => RuntimeEventKind::Rename,
                    Some("die") => RuntimeEventKind::Die,
                    _ => RuntimeEventKind::Start,
                };
                let container_id = event.actor.and_then(|actor| actor.id).unwrap_or_default();
                Ok(RuntimeEvent { kind, container_id })
            })
            .filter_map(|result: Result<RuntimeEvent, RuntimeError>| async move {
                match &result {
                    Ok(event) if event.container_id.is_empty() => None,
                    _ => Some(result),
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn follow_logs(
        &self,
        id: &str,
        options: FollowOptions,
    ) -> Result<BoxStream<'static, Result<LogLine, RuntimeError>>, RuntimeError> {
        let since = options.since.map(|t| t.timestamp()).unwrap_or(0);
        let tail = match options.tail {
            Some(n) => n.to_string(),
            None => "all".to_string(),
        };

        let stream = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: options.follow,
                    stdout: options.stdout,
                    stderr: options.stderr,
                    since,
                    tail,
                    ..Default::default()
                }),
            )
            .map(|item| {
                let output = item.map_err(|e| RuntimeError::Request { source: Box::new(e) })?;
                let (source, data) = match output {
                    LogOutput::StdOut { message } => (Source::Stdout, message.to_vec()),
                    LogOutput::StdErr { message } => (Source::Stderr, message.to_vec()),
                    LogOutput::StdIn { message } | LogOutput::Console { message } => {
                        (Source::Stdout, message.to_vec())
                    }
                };
                Ok(LogLine { source, data })
            })
            .boxed();
        Ok(LineSplitter::new(stream).into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_stream(
        items: Vec<Result<LogLine, RuntimeError>>,
    ) -> BoxStream<'static, Result<LogLine, RuntimeError>> {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn splits_multiple_lines_in_one_chunk() {
        let raw = line_stream(vec![Ok(LogLine {
            source: Source::Stdout,
            data: b"first\nsecond\n".to_vec(),
        })]);
        let lines: Vec<_> = LineSplitter::new(raw).into_stream().collect().await;
        let lines: Vec<_> = lines.into_iter().map(|r| r.unwrap().data).collect();
        assert_eq!(lines, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn reassembles_a_line_split_across_chunks() {
        let raw = line_stream(vec![
            Ok(LogLine { source: Source::Stdout, data: b"hel".to_vec() }),
            Ok(LogLine { source: Source::Stdout, data: b"lo\n".to_vec() }),
        ]);
        let lines: Vec<_> = LineSplitter::new(raw).into_stream().collect().await;
        assert_eq!(lines.into_iter().next().unwrap().unwrap().data, b"hello".to_vec());
    }

    #[tokio::test]
    async fn flushes_trailing_partial_line_at_stream_end() {
        let raw = line_stream(vec![Ok(LogLine {
            source: Source::Stderr,
            data: b"no newline".to_vec(),
        })]);
        let lines: Vec<_> = LineSplitter::new(raw).into_stream().collect().await;
        assert_eq!(lines.into_iter().next().unwrap().unwrap().data, b"no newline".to_vec());
    }

    #[tokio::test]
    async fn keeps_interleaved_sources_independent() {
        let raw = line_stream(vec![
            Ok(LogLine { source: Source::Stdout, data: b"out-a".to_vec() }),
            Ok(LogLine { source: Source::Stderr, data: b"err-a\n".to_vec() }),
            Ok(LogLine { source: Source::Stdout, data: b"out-b\n".to_vec() }),
        ]);
        let lines: Vec<_> = LineSplitter::new(raw).into_stream().collect().await;
        let lines: Vec<_> = lines.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].source, Source::Stderr);
        assert_eq!(lines[0].data, b"err-a".to_vec());
        assert_eq!(lines[1].source, Source::Stdout);
        assert_eq!(lines[1].data, b"out-b".to_vec());
    }
}
