//! The Route type, its wire descriptor, and the `<kind>://<address>`
//! URI form accepted from `ROUTE_URIS` / the CLI.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::adapter::Adapter;
use crate::error::ConfigError;
use crate::message::Source;

/// The filter predicates a Route matches candidates against. Absence
/// of a field means "match all" for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFilter {
    pub filter_id: Option<String>,
    pub filter_name: Option<String>,
    /// `(key, pattern)` pairs; an empty pattern matches mere presence of the key.
    pub filter_labels: Vec<(String, String)>,
    pub filter_sources: Vec<Source>,
}

impl RouteFilter {
    pub fn is_empty(&self) -> bool {
        self.filter_id.is_none()
            && self.filter_name.is_none()
            && self.filter_labels.is_empty()
            && self.filter_sources.is_empty()
    }
}

/// The wire form of a Route, used by both the Control API and the
/// on-disk store. Deliberately flat and serde-derived so the same
/// type backs `GET /routes`, `POST /routes`, and every `{id}.json`
/// file in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_labels: Option<Vec<String>>,
    pub adapter: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, String>>,
}

impl RouteDescriptor {
    /// Splits `adapter` into `(kind, transport)`, e.g. `"syslog+tls"`
    /// becomes `("syslog", Some("tls"))`.
    pub fn adapter_parts(&self) -> (&str, Option<&str>) {
        match self.adapter.split_once('+') {
            Some((kind, transport)) => (kind, Some(transport)),
            None => (&self.adapter, None),
        }
    }

    pub fn filter(&self) -> Result<RouteFilter, ConfigError> {
        let filter_sources = self
            .filter_sources
            .as_ref()
            .map(|sources| {
                sources
                    .iter()
                    .map(|s| {
                        s.parse::<Source>().map_err(|_| ConfigError::BadFilter {
                            reason: format!("unknown source {s:?}, expected stdout or stderr"),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let filter_labels = self
            .filter_labels
            .as_ref()
            .map(|labels| {
                labels
                    .iter()
                    .map(|entry| match entry.split_once(':') {
                        Some((key, pattern)) => Ok((key.to_string(), pattern.to_string())),
                        None => Ok((entry.clone(), String::new())),
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(RouteFilter {
            filter_id: self.filter_id.clone(),
            filter_name: self.filter_name.clone(),
            filter_labels,
            filter_sources,
        })
    }
}

/// A live Route in the registry: the filter predicates, the adapter
/// descriptor, and the runtime handles (adapter instance, cancel
/// signal, closed flag) described by the data model.
pub struct Route {
    pub id: String,
    pub filter: RouteFilter,
    pub adapter_kind: String,
    pub transport: Option<String>,
    pub address: String,
    pub options: HashMap<String, String>,
    adapter: StdMutex<Option<Box<dyn Adapter>>>,
    cancel_tx: StdMutex<Option<oneshot::Sender<()>>>,
    cancel_rx: StdMutex<Option<oneshot::Receiver<()>>>,
    closed: AtomicBool,
}

impl Route {
    pub fn new(
        id: String,
        filter: RouteFilter,
        adapter_kind: String,
        transport: Option<String>,
        address: String,
        options: HashMap<String, String>,
        adapter: Box<dyn Adapter>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        Route {
            id,
            filter,
            adapter_kind,
            transport,
            address,
            options,
            adapter: StdMutex::new(Some(adapter)),
            cancel_tx: StdMutex::new(Some(cancel_tx)),
            cancel_rx: StdMutex::new(Some(cancel_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes the boxed adapter for the one drain task permitted to
    /// consume it. Panics if called more than once for the same
    /// Route, since that would violate the single-drain-task
    /// invariant.
    pub fn take_adapter(&self) -> Box<dyn Adapter> {
        self.adapter
            .lock()
            .unwrap()
            .take()
            .expect("route adapter consumed more than once")
    }

    /// Takes the cancellation receiver for the drain task to await.
    pub fn take_cancel_rx(&self) -> oneshot::Receiver<()> {
        self.cancel_rx
            .lock()
            .unwrap()
            .take()
            .expect("route cancel receiver consumed more than once")
    }

    /// Fires the Route's one-shot cancellation signal. Idempotent:
    /// cancelling an already-cancelled Route is a no-op.
    pub fn cancel(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.cancel_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `true` iff this Route's filter names exactly one container by
    /// full id (used by the `die`-event single-container shortcut).
    pub fn is_single_container(&self) -> bool {
        self.filter.filter_name.is_none() && self.filter.filter_id.is_some()
    }

    pub fn to_descriptor(&self) -> RouteDescriptor {
        RouteDescriptor {
            id: Some(self.id.clone()),
            filter_id: self.filter.filter_id.clone(),
            filter_name: self.filter.filter_name.clone(),
            filter_sources: if self.filter.filter_sources.is_empty() {
                None
            } else {
                Some(
                    self.filter
                        .filter_sources
                        .iter()
                        .map(|s| s.as_str().to_string())
                        .collect(),
                )
            },
            filter_labels: if self.filter.filter_labels.is_empty() {
                None
            } else {
                Some(
                    self.filter
                        .filter_labels
                        .iter()
                        .map(|(k, p)| {
                            if p.is_empty() {
                                k.clone()
                            } else {
                                format!("{k}:{p}")
                            }
                        })
                        .collect(),
                )
            },
            adapter: match &self.transport {
                Some(t) => format!("{}+{}", self.adapter_kind, t),
                None => self.adapter_kind.clone(),
            },
            address: self.address.clone(),
            options: if self.options.is_empty() {
                None
            } else {
                Some(self.options.clone())
            },
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("adapter_kind", &self.adapter_kind)
            .field("transport", &self.transport)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Generates a 12-hex-character id: a hash keyed on wall-clock
/// nanoseconds, truncated to 12 hex digits.
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    nanos.hash(&mut hasher);
    format!("{:012x}", hasher.finish() & 0xffff_ffff_ffff)
}

/// Expands `$VAR` and `${VAR}` references against the process
/// environment, matching `os.ExpandEnv`'s behavior of substituting
/// the empty string for unset variables.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some((_, c2)) if c2 == '_' || c2.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek().copied() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Parses a Route URI of the form
/// `<kind>[+<transport>]://<address>[?filter.id=…&filter.name=…&filter.sources=csv&filter.labels=csv&<option>=<v>…]`
/// after environment expansion, into a [`RouteDescriptor`].
pub fn parse_uri(uri: &str) -> Result<RouteDescriptor, ConfigError> {
    let expanded = expand_env(uri);
    let url = url::Url::parse(&expanded).map_err(|e| ConfigError::BadUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    let adapter = url.scheme().to_string();
    let address = match url.host_str() {
        Some(host) => match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        },
        None => {
            return Err(ConfigError::BadUri {
                uri: uri.to_string(),
                reason: "missing host".to_string(),
            })
        }
    };

    let mut filter_id = None;
    let mut filter_name = None;
    let mut filter_sources = None;
    let mut filter_labels = None;
    let mut options = HashMap::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "filter.id" => filter_id = Some(value.into_owned()),
            "filter.name" => filter_name = Some(value.into_owned()),
            "filter.sources" => {
                filter_sources = Some(value.split(',').map(str::to_string).collect())
            }
            "filter.labels" => {
                filter_labels = Some(value.split(',').map(str::to_string).collect())
            }
            other => {
                options.insert(other.to_string(), value.into_owned());
            }
        }
    }

    Ok(RouteDescriptor {
        id: None,
        filter_id,
        filter_name,
        filter_sources,
        filter_labels,
        adapter,
        address,
        options: if options.is_empty() { None } else { Some(options) },
    })
}
