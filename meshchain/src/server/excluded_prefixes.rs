// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Adds administratively excluded address ranges to each connection's IP context

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::{
  fmt::Display,
  net::IpAddr,
  path::{Path, PathBuf},
  str::FromStr,
  sync::Arc,
  time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{
  chain::{Flow, Interceptor},
  Connection, Context, NetworkServiceRequest,
};

pub const DEFAULT_PREFIXES_PATH: &str = "/etc/excluded_prefixes.yaml";

#[derive(thiserror::Error, Debug)]
pub enum PrefixError {
  #[error("Failed to read prefix file {}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Prefix file is not valid YAML")]
  Yaml(#[from] serde_yaml::Error),
  #[error("Invalid prefix {prefix:?}: {reason}")]
  InvalidPrefix { prefix: String, reason: &'static str },
}

/// An address range in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpPrefix {
  address: IpAddr,
  length: u8,
}

impl IpPrefix {
  pub fn new(address: IpAddr, length: u8) -> Option<Self> {
    let max = match address {
      IpAddr::V4(_) => 32,
      IpAddr::V6(_) => 128,
    };
    (length <= max).then(|| Self { address, length })
  }

  pub fn address(&self) -> IpAddr {
    self.address
  }

  pub fn length(&self) -> u8 {
    self.length
  }
}

impl FromStr for IpPrefix {
  type Err = PrefixError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = |reason| PrefixError::InvalidPrefix {
      prefix: s.to_string(),
      reason,
    };
    let (address, length) = s
      .trim()
      .split_once('/')
      .ok_or_else(|| invalid("expected address/length"))?;
    let address = address
      .parse::<IpAddr>()
      .map_err(|_| invalid("address is not a valid IPv4 or IPv6 address"))?;
    let length = length
      .parse::<u8>()
      .map_err(|_| invalid("prefix length is not a number"))?;
    IpPrefix::new(address, length).ok_or_else(|| invalid("prefix length exceeds address width"))
  }
}

impl Display for IpPrefix {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.address, self.length)
  }
}

#[derive(Deserialize, Default)]
struct PrefixFile {
  #[serde(default)]
  prefixes: Vec<String>,
}

/// Parses the contents of a prefix file, which must contain a `prefixes` list
pub fn parse_prefixes(contents: &str) -> Result<Vec<IpPrefix>, PrefixError> {
  // An empty document deserializes as null rather than an empty mapping
  if contents.trim().is_empty() {
    return Ok(Vec::new());
  }
  let file: PrefixFile = serde_yaml::from_str(contents)?;
  file.prefixes.iter().map(|p| p.parse()).collect()
}

pub async fn load_prefixes<P: AsRef<Path>>(path: P) -> Result<Vec<IpPrefix>, PrefixError> {
  let path = path.as_ref();
  let contents = tokio::fs::read_to_string(path)
    .await
    .map_err(|source| PrefixError::Io {
      path: path.to_path_buf(),
      source,
    })?;
  parse_prefixes(&contents)
}

pub struct ExcludedPrefixesServer {
  path: PathBuf,
  prefixes: ArcSwap<Vec<IpPrefix>>,
}

impl ExcludedPrefixesServer {
  /// Creates the element with no prefixes; call [`reload`](Self::reload) to read `path`
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self {
      path: path.into(),
      prefixes: ArcSwap::from_pointee(Vec::new()),
    }
  }

  /// Creates the element and performs an initial load, tolerating failure
  pub async fn from_file<P: Into<PathBuf>>(path: P) -> Self {
    let server = Self::new(path);
    // Errors are logged by reload and leave the list empty
    let _ = server.reload().await;
    server
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn prefixes(&self) -> Arc<Vec<IpPrefix>> {
    self.prefixes.load_full()
  }

  /// Re-reads the prefix file, keeping the current list if it cannot be used
  pub async fn reload(&self) -> Result<Arc<Vec<IpPrefix>>, PrefixError> {
    match load_prefixes(&self.path).await {
      Ok(prefixes) => {
        let prefixes = Arc::new(prefixes);
        self.prefixes.store(Arc::clone(&prefixes));
        tracing::info!(path = %self.path.display(), count = prefixes.len(), "Loaded excluded prefixes");
        Ok(prefixes)
      }
      Err(e) => {
        tracing::error!(path = %self.path.display(), error = ?e, "Failed to load excluded prefixes; keeping previous list");
        Err(e)
      }
    }
  }
}

/// What a file looked like when last examined, used to notice changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
  modified: Option<SystemTime>,
  len: u64,
}

async fn stamp_of(path: &Path) -> Option<FileStamp> {
  let metadata = tokio::fs::metadata(path).await.ok()?;
  Some(FileStamp {
    modified: metadata.modified().ok(),
    len: metadata.len(),
  })
}

impl ExcludedPrefixesServer {
  /// Polls the prefix file every `period`, reloading whenever it changes, until cancelled
  pub fn watch(
    self: Arc<Self>,
    period: Duration,
    cancellation: CancellationToken,
  ) -> JoinHandle<()> {
    let this = self;
    tokio::task::spawn(async move {
      let mut last = stamp_of(&this.path).await;
      let mut interval = tokio::time::interval(period);
      loop {
        tokio::select! {
          _ = cancellation.cancelled() => break,
          _ = interval.tick() => {}
        }
        let current = stamp_of(&this.path).await;
        if current != last {
          last = current;
          if current.is_some() {
            // Failures are logged by reload and leave the previous list in place
            let _ = this.reload().await;
          }
        }
      }
      tracing::debug!(path = %this.path.display(), "Stopped watching excluded prefixes");
    })
  }
}

impl Interceptor for ExcludedPrefixesServer {
  fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection> {
    let prefixes = self.prefixes.load();
    let excluded = &mut request.connection.context.ip_context.excluded_prefixes;
    excluded.extend(prefixes.iter().map(ToString::to_string));
    // Compare by parsed prefix so spellings like 10.0.0.0/08 and 10.0.0.0/8 collapse;
    // entries that do not parse are compared as written
    let mut seen = std::collections::HashSet::new();
    excluded.retain(|p| match p.parse::<IpPrefix>() {
      Ok(prefix) => seen.insert(prefix.to_string()),
      Err(_) => seen.insert(p.clone()),
    });
    tracing::trace!(connection_id = %request.connection.id, excluded = ?request.connection.context.ip_context.excluded_prefixes, "Applied excluded prefixes");
    Flow::proceed(ctx)
  }
}

#[cfg(test)]
mod tests {
  use std::{io::Write, sync::Arc};

  use super::{parse_prefixes, ExcludedPrefixesServer, IpPrefix, PrefixError};
  use crate::common::{
    chain::{intercept, testing::Recorder, Intercept},
    ArcServer, Chain, Connection, Context,
  };

  fn prefix_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
  }

  #[test]
  fn prefixes_are_validated() {
    assert_eq!(
      "10.96.0.0/12".parse::<IpPrefix>().unwrap().to_string(),
      "10.96.0.0/12"
    );
    assert_eq!("fd00::/8".parse::<IpPrefix>().unwrap().length(), 8);
    for bad in ["10.0.0.0", "10.0.0.0/33", "not-an-ip/8", "fd00::/129", "10.0.0.0/x"] {
      assert!(
        matches!(bad.parse::<IpPrefix>(), Err(PrefixError::InvalidPrefix { .. })),
        "{} must be rejected",
        bad
      );
    }
  }

  #[test]
  fn empty_documents_have_no_prefixes() {
    assert!(parse_prefixes("").unwrap().is_empty());
    assert!(parse_prefixes("prefixes: []\n").unwrap().is_empty());
    assert!(matches!(
      parse_prefixes("prefixes: [10.0.0.0/8, bogus]"),
      Err(PrefixError::InvalidPrefix { .. })
    ));
  }

  #[tokio::test]
  async fn prefixes_are_appended_without_duplicates() {
    let file = prefix_file("prefixes:\n  - 10.96.0.0/12\n  - 10.32.0.0/12\n");
    let server = ExcludedPrefixesServer::from_file(file.path()).await;
    assert_eq!(server.prefixes().len(), 2);

    let recorder = Recorder::accepting_all();
    let chain = Chain::new(vec![intercept(server), recorder.clone() as ArcServer]);
    let mut connection = Connection::new("conn-1", Default::default());
    connection.context.ip_context.excluded_prefixes =
      vec!["172.16.0.0/16".into(), "10.32.0.0/12".into()];
    let result = chain
      .handle_request(Context::new(), connection.into())
      .await
      .unwrap();
    assert_eq!(
      result.context.ip_context.excluded_prefixes,
      vec!["172.16.0.0/16", "10.32.0.0/12", "10.96.0.0/12"]
    );
  }

  #[tokio::test]
  async fn equivalent_spellings_are_deduplicated() {
    let file = prefix_file("prefixes:\n  - 10.0.0.0/8\n  - fd00::/8\n");
    let server = ExcludedPrefixesServer::from_file(file.path()).await;
    let chain = Chain::new(vec![intercept(server)]);
    let mut connection = Connection::new("conn-1", Default::default());
    connection.context.ip_context.excluded_prefixes =
      vec!["10.0.0.0/08".into(), "fd00:0::/8".into(), "not-a-prefix".into()];
    let result = chain
      .handle_request(Context::new(), connection.into())
      .await
      .unwrap();
    assert_eq!(
      result.context.ip_context.excluded_prefixes,
      vec!["10.0.0.0/08", "fd00:0::/8", "not-a-prefix"],
      "Prefixes already present under another spelling must not be added again"
    );
  }

  #[tokio::test]
  async fn failed_reload_keeps_previous_list() {
    let file = prefix_file("prefixes:\n  - 10.96.0.0/12\n");
    let server = Arc::new(Intercept::new(
      ExcludedPrefixesServer::from_file(file.path()).await,
    ));
    assert_eq!(server.inner().prefixes().len(), 1);

    std::fs::write(file.path(), "prefixes: [\"10.0.0.0/99\"]\n").unwrap();
    assert!(server.inner().reload().await.is_err());
    assert_eq!(
      server.inner().prefixes().iter().map(ToString::to_string).collect::<Vec<_>>(),
      vec!["10.96.0.0/12"]
    );
  }

  #[tokio::test]
  async fn watched_files_are_reloaded_on_change() {
    let file = prefix_file("prefixes:\n  - 10.96.0.0/12\n");
    let server = Arc::new(ExcludedPrefixesServer::from_file(file.path()).await);
    let cancellation = tokio_util::sync::CancellationToken::new();
    let watcher = Arc::clone(&server).watch(std::time::Duration::from_millis(10), cancellation.clone());

    std::fs::write(
      file.path(),
      "prefixes:\n  - 10.96.0.0/12\n  - 192.168.0.0/16\n",
    )
    .unwrap();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while server.prefixes().len() != 2 && tokio::time::Instant::now() < deadline {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(server.prefixes().len(), 2);

    cancellation.cancel();
    watcher.await.unwrap();
  }

  #[tokio::test]
  async fn missing_file_starts_empty_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("excluded_prefixes.yaml");
    let server = ExcludedPrefixesServer::from_file(&path).await;
    assert!(server.prefixes().is_empty());
    assert!(matches!(server.reload().await, Err(PrefixError::Io { .. })));

    std::fs::write(&path, "prefixes:\n  - 192.168.0.0/16\n").unwrap();
    server.reload().await.unwrap();
    assert_eq!(server.prefixes()[0].to_string(), "192.168.0.0/16");
  }
}
