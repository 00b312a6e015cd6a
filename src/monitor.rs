//! The source role: bridge tracker events onto an outbound connection and
//! manage the connect/reconnect lifecycle.
//!
//! Delivery is at-most-once and best-effort: events observed while
//! disconnected are dropped, there is no queue and no retry buffer. File
//! content is read fresh from disk at send time, never cached from the
//! event.
//!
//! Each connection gets a task watching the read side of the socket, so a
//! server-side disconnect is noticed even while the monitor has nothing to
//! send.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::WireMessage;
use crate::tracker::FileTracker;
use crate::tracker::event::{ChangeEvent, ChangeKind};

/// Cap on a single outbound connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MonitorSettings {
    pub host: String,
    pub port: u16,
    /// Emit a synthetic Added for every tracked file after each (re)connect.
    pub sync_on_connect: bool,
    /// Fixed reconnect interval. No backoff growth, unbounded retries.
    pub reconnect: Duration,
}

enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(OwnedWriteHalf),
}

pub struct Monitor {
    tracker: FileTracker,
    settings: MonitorSettings,
    state: ConnectionState,
    /// When armed, the next reconnect attempt fires at this instant.
    reconnect_at: Option<Instant>,
    /// Bumped on every successful connect. Disconnect notices carry the
    /// generation of the connection they watched, so a notice outliving its
    /// connection cannot tear down the replacement.
    generation: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleAction {
    Continue,
    Quit,
}

impl Monitor {
    pub fn new(tracker: FileTracker, settings: MonitorSettings) -> Self {
        Self {
            tracker,
            settings,
            state: ConnectionState::Disconnected,
            reconnect_at: None,
            generation: 0,
        }
    }

    /// Drive the monitor until `quit` is entered on the console.
    ///
    /// One control loop handles everything: dirty-directory notifications
    /// from the tracker's watcher, the reconnect timer, disconnect notices
    /// from the connection watch, and the interactive console on stdin.
    pub async fn run(mut self, mut dirty_rx: mpsc::Receiver<PathBuf>) -> anyhow::Result<()> {
        let (closed_tx, mut closed_rx) = mpsc::channel::<u64>(4);
        self.connect(&closed_tx).await;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut console_open = true;

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                dirty = dirty_rx.recv() => {
                    let Some(path) = dirty else {
                        anyhow::bail!("watcher notification channel closed");
                    };
                    let events = self.tracker.rescan(&path);
                    for event in &events {
                        self.send_event(event).await;
                    }
                }
                _ = reconnect_delay(reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect(&closed_tx).await;
                }
                closed = closed_rx.recv() => {
                    if closed == Some(self.generation) {
                        warn!("server closed the connection");
                        self.mark_disconnected();
                    }
                }
                line = lines.next_line(), if console_open => {
                    match line {
                        Ok(Some(line)) => {
                            if self.handle_command(line.trim()) == ConsoleAction::Quit {
                                return Ok(());
                            }
                        }
                        Ok(None) => console_open = false,
                        Err(err) => {
                            warn!(%err, "console read failed, disabling console");
                            console_open = false;
                        }
                    }
                }
            }
        }
    }

    /// Establish the outbound connection. A fresh attempt always discards
    /// any prior connection first; only one attempt is in flight at a time.
    async fn connect(&mut self, closed_tx: &mpsc::Sender<u64>) {
        self.state = ConnectionState::Connecting;
        info!(host = %self.settings.host, port = self.settings.port, "connecting");

        let attempt = TcpStream::connect((self.settings.host.as_str(), self.settings.port));
        match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
            Ok(Ok(stream)) => {
                info!("connected");
                self.reconnect_at = None;
                self.generation += 1;
                let (read_half, write_half) = stream.into_split();
                self.state = ConnectionState::Connected(write_half);
                spawn_disconnect_watch(read_half, self.generation, closed_tx.clone());
                if self.settings.sync_on_connect {
                    self.sync_all_files().await;
                }
            }
            Ok(Err(err)) => {
                warn!(%err, "connection failed");
                self.mark_disconnected();
            }
            Err(_) => {
                warn!("connection attempt timed out");
                self.mark_disconnected();
            }
        }
    }

    /// Drop into Disconnected and arm the reconnect timer if it is not
    /// already armed.
    fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        if self.reconnect_at.is_none() {
            debug!(secs = self.settings.reconnect.as_secs(), "arming reconnect timer");
            self.reconnect_at = Some(Instant::now() + self.settings.reconnect);
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    /// Full-state reconciliation: the remote side has no prior state, so
    /// every currently-tracked file goes out as an Added.
    async fn sync_all_files(&mut self) {
        let mut events: Vec<ChangeEvent> = self
            .tracker
            .tracking_set()
            .iter()
            .flat_map(|(id, entry)| {
                entry.snapshot.keys().map(|filename| ChangeEvent {
                    kind: ChangeKind::Added,
                    id: id.clone(),
                    directory: entry.path.clone(),
                    filename: filename.clone(),
                })
            })
            .collect();
        events.sort_by(|a, b| (&a.id, &a.filename).cmp(&(&b.id, &b.filename)));

        info!(files = events.len(), "syncing all tracked files");
        for event in &events {
            self.send_event(event).await;
        }
    }

    async fn send_event(&mut self, event: &ChangeEvent) {
        if !self.is_connected() {
            debug!(
                kind = ?event.kind,
                id = %event.id,
                filename = %event.filename,
                "change observed while disconnected, dropped"
            );
            return;
        }
        let msg = message_for_event(event);
        self.send_message(&msg).await;
    }

    async fn send_message(&mut self, msg: &WireMessage) {
        let ConnectionState::Connected(stream) = &mut self.state else {
            return;
        };
        match stream.write_all(&msg.encode()).await {
            Ok(()) => {
                debug!(id = %msg.id, filename = %msg.filename, "event written to server");
            }
            Err(err) => {
                warn!(%err, "write failed, disconnecting");
                self.mark_disconnected();
            }
        }
    }

    /// One line of the interactive console:
    /// `track <id> <path>`, `untrack <id>`, `tracked`, `help`, `quit`.
    fn handle_command(&mut self, line: &str) -> ConsoleAction {
        if line.is_empty() || line.starts_with('#') {
            return ConsoleAction::Continue;
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        match command {
            "tracked" => {
                let mut entries: Vec<_> = self.tracker.tracking_set().iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                println!("Currently tracking");
                println!("    {:<30} Path", "Id");
                for (id, entry) in entries {
                    println!("    {:<30} {}", id, entry.path.display());
                }
            }
            "track" => {
                let id = parts.next();
                let path: Vec<&str> = parts.collect();
                match (id, path.is_empty()) {
                    (Some(id), false) => {
                        let path = PathBuf::from(path.join(" "));
                        if self.tracker.track(id, &path) {
                            println!(" - tracking: '{}' -> '{}'", id, path.display());
                        } else {
                            println!(" - failed to set up tracking: '{}' -> '{}'", id, path.display());
                        }
                    }
                    _ => println!("Malformed 'track' command, try 'help'"),
                }
            }
            "untrack" => match parts.next() {
                Some(id) => {
                    if self.tracker.untrack(id) {
                        println!(" - stopped tracking: '{id}'");
                    } else {
                        println!(" - failed to stop tracking: '{id}'");
                    }
                }
                None => println!("Malformed 'untrack' command, try 'help'"),
            },
            "help" => print_console_help(),
            "quit" => return ConsoleAction::Quit,
            _ => println!("Unknown command, try 'help'"),
        }
        ConsoleAction::Continue
    }
}

async fn reconnect_delay(at: Option<Instant>) {
    match at {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

/// Watch the read side of a connection until it closes. The server never
/// sends application data, so a zero-byte read or a read error both mean the
/// connection is gone. Waiting on a write failure instead would miss idle
/// disconnects and lose the first post-disconnect event to the kernel's send
/// buffer.
fn spawn_disconnect_watch(
    mut read_half: OwnedReadHalf,
    generation: u64,
    closed_tx: mpsc::Sender<u64>,
) {
    tokio::spawn(async move {
        let mut scratch = [0u8; 64];
        loop {
            match read_half.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(generation).await;
    });
}

/// Turn a tracker event into its wire message, reading file content from
/// disk now. An unreadable file still produces a message, with an empty
/// payload, so the remote copy at least reflects that the file exists.
fn message_for_event(event: &ChangeEvent) -> WireMessage {
    match event.kind {
        ChangeKind::Removed => WireMessage::remove(&event.id, &event.filename),
        ChangeKind::Added | ChangeKind::Changed => {
            let path = event.directory.join(&event.filename);
            let payload = match std::fs::read(&path) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read file, sending empty payload");
                    Bytes::new()
                }
            };
            if event.kind == ChangeKind::Added {
                WireMessage::add(&event.id, &event.filename, payload)
            } else {
                WireMessage::change(&event.id, &event.filename, payload)
            }
        }
    }
}

fn print_console_help() {
    println!(
        "Accepted commands:\n\
         \n\
         \x20   tracked                 Lists the currently tracked directories\n\
         \x20   track <id> <path>       Begins tracking <path> and gives it the name <id>\n\
         \x20   untrack <id>            Stops tracking the path named with <id>\n\
         \x20   help                    Prints this help\n\
         \x20   quit                    Quits the application"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::fs;

    fn test_monitor() -> Monitor {
        let (tracker, _rx) = FileTracker::new().expect("tracker");
        Monitor::new(
            tracker,
            MonitorSettings {
                host: "127.0.0.1".into(),
                port: 0,
                sync_on_connect: false,
                reconnect: Duration::from_secs(10),
            },
        )
    }

    #[test]
    fn test_message_for_removed_has_no_payload() {
        let event = ChangeEvent {
            kind: ChangeKind::Removed,
            id: "x".into(),
            directory: "/nowhere".into(),
            filename: "a.qml".into(),
        };
        let msg = message_for_event(&event);
        assert_eq!(msg.kind, MessageKind::Remove);
        assert_eq!(msg.payload, None);
    }

    #[test]
    fn test_message_for_added_reads_content_fresh() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.qml"), "Item {}").unwrap();

        let event = ChangeEvent {
            kind: ChangeKind::Added,
            id: "x".into(),
            directory: dir.path().to_path_buf(),
            filename: "a.qml".into(),
        };
        let msg = message_for_event(&event);
        assert_eq!(msg.kind, MessageKind::Add);
        assert_eq!(msg.payload.as_deref(), Some(&b"Item {}"[..]));
    }

    #[test]
    fn test_message_for_unreadable_file_is_empty_payload() {
        let event = ChangeEvent {
            kind: ChangeKind::Changed,
            id: "x".into(),
            directory: "/nowhere".into(),
            filename: "ghost.qml".into(),
        };
        let msg = message_for_event(&event);
        assert_eq!(msg.kind, MessageKind::Change);
        assert_eq!(msg.payload.as_deref(), Some(&[][..]));
    }

    #[tokio::test]
    async fn test_idle_disconnect_arms_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tracker, dirty_rx) = FileTracker::new().expect("tracker");
        let monitor = Monitor::new(
            tracker,
            MonitorSettings {
                host: "127.0.0.1".into(),
                port,
                sync_on_connect: false,
                reconnect: Duration::from_millis(200),
            },
        );
        tokio::spawn(monitor.run(dirty_rx));

        // Close the server side while the monitor sits idle with nothing
        // to send. The disconnect must be noticed on the read side.
        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(
            second.is_ok(),
            "monitor never reconnected after an idle disconnect"
        );
    }

    #[tokio::test]
    async fn test_reconnect_timer_arms_once() {
        let mut monitor = test_monitor();
        monitor.mark_disconnected();
        let first = monitor.reconnect_at.expect("armed");
        monitor.mark_disconnected();
        assert_eq!(monitor.reconnect_at, Some(first), "already-armed timer must not reset");
    }

    #[tokio::test]
    async fn test_console_track_untrack_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = test_monitor();

        let cmd = format!("track ui {}", dir.path().display());
        assert_eq!(monitor.handle_command(&cmd), ConsoleAction::Continue);
        assert!(monitor.tracker.tracking_set().contains_key("ui"));

        assert_eq!(monitor.handle_command("untrack ui"), ConsoleAction::Continue);
        assert!(monitor.tracker.tracking_set().is_empty());
    }

    #[tokio::test]
    async fn test_console_quit_and_comments() {
        let mut monitor = test_monitor();
        assert_eq!(monitor.handle_command(""), ConsoleAction::Continue);
        assert_eq!(monitor.handle_command("# comment"), ConsoleAction::Continue);
        assert_eq!(monitor.handle_command("bogus"), ConsoleAction::Continue);
        assert_eq!(monitor.handle_command("quit"), ConsoleAction::Quit);
    }
}
