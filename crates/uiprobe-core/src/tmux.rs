//! Authoritative state from tmux.
//!
//! [`TmuxSnapshotter`] issues the minimal control queries and shapes the
//! answers into a [`Snapshot`]:
//!
//! - `list-windows -F` for windows (ids, names, active flag);
//! - `list-panes -F` for the active window's panes (geometry, active flag);
//! - `capture-pane -p` per pane when content digests are enabled.
//!
//! Helper windows whose names begin with `__` (pane stacks, pane groups,
//! floats) are hidden from the UI's tab bar and skipped by default.

use std::future::Future;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Error, Result, UnavailableError};
use crate::retry::{RetryPolicy, with_smart_retry};
use crate::snapshot::{Entity, EntityKind, Geometry, Snapshot, Snapshotter};

/// Request/response access to a tmux server.
pub trait ControlChannel: Send + Sync {
    /// Run one tmux command and return its stdout.
    fn request(&self, args: &[&str]) -> impl Future<Output = Result<String>> + Send;
}

impl<T: ControlChannel + ?Sized> ControlChannel for std::sync::Arc<T> {
    fn request(&self, args: &[&str]) -> impl Future<Output = Result<String>> + Send {
        (**self).request(args)
    }
}

/// Runs the tmux binary once per request.
#[derive(Debug, Clone)]
pub struct TmuxCli {
    binary: String,
    socket: Option<String>,
    command_timeout: Duration,
}

impl Default for TmuxCli {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            socket: None,
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl TmuxCli {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Use a named server socket (`tmux -L <socket>`).
    #[must_use]
    pub fn with_socket(mut self, socket: Option<String>) -> Self {
        self.socket = socket;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

fn classify_stderr(stderr: &str) -> UnavailableError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no server running")
        || lower.contains("can't find session")
        || lower.contains("error connecting")
    {
        UnavailableError::NotRunning(stderr.trim().to_string())
    } else {
        UnavailableError::CommandFailed(stderr.trim().to_string())
    }
}

impl ControlChannel for TmuxCli {
    async fn request(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        if let Some(socket) = &self.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Err(_) => {
                return Err(UnavailableError::Timeout {
                    source_name: format!("{} {}", self.binary, args.first().unwrap_or(&"")),
                    timeout_ms: self.command_timeout.as_millis() as u64,
                }
                .into());
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(UnavailableError::CliNotFound(self.binary.clone()).into());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(&stderr).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

const WINDOW_FORMAT: &str = "#{window_id}\t#{window_index}\t#{window_active}\t#{window_name}";
const PANE_FORMAT: &str =
    "#{pane_id}\t#{window_id}\t#{pane_left}\t#{pane_top}\t#{pane_width}\t#{pane_height}\t#{pane_active}";

#[derive(Debug, Clone, PartialEq, Eq)]
struct WindowRow {
    id: String,
    index: u32,
    active: bool,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PaneRow {
    id: String,
    window: String,
    geometry: Geometry,
    active: bool,
}

fn flag(field: &str, line: &str) -> Result<bool> {
    match field {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(Error::Parse(format!(
            "expected 0/1 flag, got {other:?} in line {line:?}"
        ))),
    }
}

fn number<T: std::str::FromStr>(field: &str, what: &str, line: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::Parse(format!("bad {what} {field:?} in line {line:?}")))
}

fn parse_windows(output: &str) -> Result<Vec<WindowRow>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(4, '\t').collect();
            let [id, index, active, name] = fields[..] else {
                return Err(Error::Parse(format!("malformed window line {line:?}")));
            };
            if !id.starts_with('@') {
                return Err(Error::Parse(format!("bad window id {id:?} in line {line:?}")));
            }
            Ok(WindowRow {
                id: id.to_string(),
                index: number(index, "window index", line)?,
                active: flag(active, line)?,
                name: name.to_string(),
            })
        })
        .collect()
}

fn parse_panes(output: &str) -> Result<Vec<PaneRow>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let [id, window, left, top, width, height, active] = fields[..] else {
                return Err(Error::Parse(format!("malformed pane line {line:?}")));
            };
            if !id.starts_with('%') {
                return Err(Error::Parse(format!("bad pane id {id:?} in line {line:?}")));
            }
            Ok(PaneRow {
                id: id.to_string(),
                window: window.to_string(),
                geometry: Geometry::new(
                    number(left, "pane_left", line)?,
                    number(top, "pane_top", line)?,
                    number(width, "pane_width", line)?,
                    number(height, "pane_height", line)?,
                ),
                active: flag(active, line)?,
            })
        })
        .collect()
}

/// What a `__`-prefixed helper window stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiddenWindow {
    /// `__%N_stack_M`: stacked alternative of pane `%N`.
    Stack { parent_pane: String, index: u32 },
    /// `__%N_group_M`: tab of pane group anchored at `%N`.
    Group { parent_pane: String, index: u32 },
    /// `__float_N`: floating pane holder.
    Float { index: u32 },
    /// Any other `__` name.
    Other,
}

/// Parse a helper window name. `None` when the window is not hidden.
#[must_use]
pub fn parse_hidden_window(name: &str) -> Option<HiddenWindow> {
    let rest = name.strip_prefix("__")?;
    if let Some(n) = rest.strip_prefix("float_") {
        return Some(
            n.parse()
                .map_or(HiddenWindow::Other, |index| HiddenWindow::Float { index }),
        );
    }
    let Some(pane_and_tail) = rest.strip_prefix('%') else {
        return Some(HiddenWindow::Other);
    };
    for (marker, is_stack) in [("_stack_", true), ("_group_", false)] {
        if let Some((pane, index)) = pane_and_tail.split_once(marker) {
            let (false, Ok(index)) = (pane.is_empty(), index.parse::<u32>()) else {
                return Some(HiddenWindow::Other);
            };
            let parent_pane = format!("%{pane}");
            return Some(if is_stack {
                HiddenWindow::Stack { parent_pane, index }
            } else {
                HiddenWindow::Group { parent_pane, index }
            });
        }
    }
    Some(HiddenWindow::Other)
}

/// Captures the authoritative snapshot of one tmux session.
#[derive(Debug, Clone)]
pub struct TmuxSnapshotter<C> {
    channel: C,
    session: String,
    include_content: bool,
    include_hidden_windows: bool,
    retry: RetryPolicy,
}

impl<C: ControlChannel> TmuxSnapshotter<C> {
    pub fn new(channel: C, session: impl Into<String>) -> Self {
        Self {
            channel,
            session: session.into(),
            include_content: false,
            include_hidden_windows: false,
            retry: RetryPolicy::tmux_cli(),
        }
    }

    #[must_use]
    pub fn with_content(mut self, include: bool) -> Self {
        self.include_content = include;
        self
    }

    #[must_use]
    pub fn with_hidden_windows(mut self, include: bool) -> Self {
        self.include_hidden_windows = include;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    async fn query(&self, args: &[&str]) -> Result<String> {
        with_smart_retry(&self.retry, || self.channel.request(args)).await
    }

    #[instrument(skip(self), fields(session = %self.session))]
    async fn capture_snapshot(&self) -> Result<Snapshot> {
        let windows = parse_windows(
            &self
                .query(&["list-windows", "-t", self.session.as_str(), "-F", WINDOW_FORMAT])
                .await?,
        )?;
        let panes = parse_panes(
            &self
                .query(&["list-panes", "-t", self.session.as_str(), "-F", PANE_FORMAT])
                .await?,
        )?;

        let mut entities = Vec::with_capacity(windows.len() + panes.len());
        for window in &windows {
            match parse_hidden_window(&window.name) {
                None => entities.push(
                    Entity::new(&window.id, EntityKind::Window).with_active(window.active),
                ),
                Some(_) if !self.include_hidden_windows => {
                    debug!(window = %window.id, name = %window.name, "skipping hidden window");
                }
                Some(HiddenWindow::Stack { parent_pane, .. } | HiddenWindow::Group { parent_pane, .. }) => {
                    entities.push(Entity::new(&window.id, EntityKind::Group).with_parent(parent_pane));
                }
                Some(HiddenWindow::Float { .. } | HiddenWindow::Other) => {
                    entities.push(Entity::new(&window.id, EntityKind::Group));
                }
            }
        }

        for pane in panes {
            let mut entity = Entity::pane(&pane.id)
                .with_parent(pane.window)
                .with_geometry(pane.geometry)
                .with_active(pane.active);
            if self.include_content {
                let text = self.query(&["capture-pane", "-p", "-t", pane.id.as_str()]).await?;
                entity = entity.with_content(&text);
            }
            entities.push(entity);
        }

        debug!(
            windows = windows.len(),
            entities = entities.len(),
            "captured tmux snapshot"
        );
        Ok(Snapshot::new(entities))
    }
}

impl<C: ControlChannel> Snapshotter for TmuxSnapshotter<C> {
    fn capture(&self) -> impl Future<Output = Result<Snapshot>> + Send {
        self.capture_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted channel keyed by the tmux subcommand.
    #[derive(Default)]
    struct FakeChannel {
        windows: String,
        panes: String,
        requests: Mutex<Vec<String>>,
    }

    impl ControlChannel for FakeChannel {
        async fn request(&self, args: &[&str]) -> Result<String> {
            self.requests.lock().unwrap().push(args.join(" "));
            match args.first().copied() {
                Some("list-windows") => Ok(self.windows.clone()),
                Some("list-panes") => Ok(self.panes.clone()),
                Some("capture-pane") => Ok(format!("content of {}\n\n", args[3])),
                _ => Err(UnavailableError::CommandFailed("unknown".into()).into()),
            }
        }
    }

    fn fake() -> FakeChannel {
        FakeChannel {
            windows: "@0\t0\t1\tmain\n@1\t1\t0\tlogs\n@2\t2\t0\t__%0_stack_1\n".into(),
            panes: "%0\t@0\t0\t0\t80\t24\t1\n%1\t@0\t81\t0\t79\t24\t0\n".into(),
            requests: Mutex::default(),
        }
    }

    #[tokio::test]
    async fn snapshot_has_windows_and_panes() {
        let snap = TmuxSnapshotter::new(fake(), "tmuxy").capture().await.unwrap();
        assert_eq!(snap.len(), 4);
        let pane = snap.get("%1").unwrap();
        assert_eq!(pane.geometry, Some(Geometry::new(81, 0, 79, 24)));
        assert_eq!(pane.parent.as_deref(), Some("@0"));
        assert!(!pane.active);
        assert!(snap.get("@0").unwrap().active);
        assert!(snap.get("@2").is_none(), "hidden window leaked");
        assert!(pane.content_digest.is_none());
    }

    #[tokio::test]
    async fn hidden_windows_become_groups_on_request() {
        let snap = TmuxSnapshotter::new(fake(), "tmuxy")
            .with_hidden_windows(true)
            .capture()
            .await
            .unwrap();
        let group = snap.get("@2").unwrap();
        assert_eq!(group.kind, EntityKind::Group);
        assert_eq!(group.parent.as_deref(), Some("%0"));
    }

    #[tokio::test]
    async fn content_digest_uses_capture_pane() {
        let channel = fake();
        let snapshotter = TmuxSnapshotter::new(channel, "tmuxy").with_content(true);
        let snap = snapshotter.capture().await.unwrap();
        assert_eq!(
            snap.get("%0").unwrap().content_digest,
            Some(crate::snapshot::content_digest("content of %0"))
        );
        let requests = snapshotter.channel.requests.lock().unwrap();
        assert!(requests.iter().any(|r| r == "capture-pane -p -t %1"));
    }

    #[tokio::test]
    async fn malformed_output_is_a_parse_error() {
        let channel = FakeChannel {
            panes: "%0\t@0\t0\t0\tx\t24\t1\n".into(),
            ..fake()
        };
        let err = TmuxSnapshotter::new(channel, "tmuxy").capture().await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");

        let channel = FakeChannel {
            windows: "@0\t0\n".into(),
            ..fake()
        };
        let err = TmuxSnapshotter::new(channel, "tmuxy").capture().await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn window_names_may_contain_tabs() {
        let rows = parse_windows("@3\t4\t0\tname\twith tab\n").unwrap();
        assert_eq!(rows[0].name, "name\twith tab");
        assert_eq!(rows[0].index, 4);
    }

    #[test]
    fn hidden_window_names() {
        assert_eq!(parse_hidden_window("main"), None);
        assert_eq!(
            parse_hidden_window("__%5_stack_1"),
            Some(HiddenWindow::Stack {
                parent_pane: "%5".into(),
                index: 1
            })
        );
        assert_eq!(
            parse_hidden_window("__%12_group_0"),
            Some(HiddenWindow::Group {
                parent_pane: "%12".into(),
                index: 0
            })
        );
        assert_eq!(
            parse_hidden_window("__float_3"),
            Some(HiddenWindow::Float { index: 3 })
        );
        assert_eq!(parse_hidden_window("__%_stack_1"), Some(HiddenWindow::Other));
        assert_eq!(parse_hidden_window("__%5_stack_"), Some(HiddenWindow::Other));
        assert_eq!(parse_hidden_window("__workspace"), Some(HiddenWindow::Other));
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("no server running on /tmp/tmux-0/default"),
            UnavailableError::NotRunning(_)
        ));
        assert!(matches!(
            classify_stderr("can't find session: tmuxy"),
            UnavailableError::NotRunning(_)
        ));
        assert!(matches!(
            classify_stderr("unknown command: frob"),
            UnavailableError::CommandFailed(_)
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_cli_not_found() {
        let cli = TmuxCli::new().with_binary("/nonexistent/uiprobe-tmux");
        let err = cli.request(&["list-sessions"]).await.unwrap_err();
        assert!(
            matches!(err, Error::Unavailable(UnavailableError::CliNotFound(_))),
            "got {err:?}"
        );
    }
}
