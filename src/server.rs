//! The sink role: accept one monitor connection, apply pushed file
//! mutations to mapped local directories, and coalesce reloads.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{MessageKind, WireError, WireMessage};
use crate::reload::ReloadHandler;

/// Receives file mutations from a single monitor and applies them under the
/// configured id→directory mapping. The mapping is fixed for the lifetime of
/// the server.
pub struct ContentServer {
    mappings: HashMap<String, PathBuf>,
    reload: Arc<dyn ReloadHandler>,
}

impl ContentServer {
    pub fn new(mappings: HashMap<String, PathBuf>, reload: Arc<dyn ReloadHandler>) -> Self {
        Self { mappings, reload }
    }

    /// Accept and serve connections forever. Only one connection is active
    /// at a time; while one is, further connection attempts are dropped.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        // Reload coalescing: a capacity-1 channel is the pending-reload
        // flag. try_send on a full channel is a no-op, and the "flag" clears
        // exactly when the reload task picks the token up and runs.
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        let handler = Arc::clone(&self.reload);
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                handler.request_reload();
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected");
                    self.serve_client(stream, &listener, &reload_tx).await;
                    info!(%peer, "client connection closed");
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            }
        }
    }

    /// Read from the active connection until it closes or turns out to be
    /// corrupt. Returning drops the stream and any partially-buffered
    /// message with it.
    async fn serve_client(
        &self,
        mut stream: TcpStream,
        listener: &TcpListener,
        reload_tx: &mpsc::Sender<()>,
    ) {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((socket, peer)) = accepted {
                        warn!(%peer, "rejecting connection, a client is already active");
                        drop(socket);
                    }
                }
                read = stream.read_buf(&mut buf) => {
                    let mut eof = match read {
                        Ok(0) => true,
                        Ok(_) => false,
                        Err(err) => {
                            warn!(%err, "read failed, dropping connection");
                            return;
                        }
                    };

                    // Drain everything else that is immediately readable
                    // before triggering anything, so a burst of mutations
                    // (e.g. a full sync) coalesces into one reload.
                    while !eof {
                        match stream.try_read_buf(&mut buf) {
                            Ok(0) => eof = true,
                            Ok(_) => {}
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(err) => {
                                warn!(%err, "read failed, dropping connection");
                                return;
                            }
                        }
                    }

                    let (processed, error) = self.drain_messages(&mut buf);
                    if processed > 0 {
                        // Mutations applied before a corrupt frame still
                        // warrant a reload.
                        let _ = reload_tx.try_send(());
                    }
                    if let Some(err) = error {
                        warn!(%err, "protocol error, dropping connection");
                        return;
                    }

                    if eof {
                        return;
                    }
                }
            }
        }
    }

    /// Decode and apply every complete message at the front of `buf`.
    /// Returns how many were processed and, if the buffer turned out
    /// corrupt, the error. Messages decoded before a corrupt frame are
    /// already applied; an incomplete tail stays buffered.
    fn drain_messages(&self, buf: &mut BytesMut) -> (usize, Option<WireError>) {
        let mut processed = 0;
        loop {
            match WireMessage::decode(&buf[..]) {
                Ok((msg, consumed)) => {
                    buf.advance(consumed);
                    self.apply(&msg);
                    processed += 1;
                }
                Err(err) if err.is_incomplete() => return (processed, None),
                Err(err) => return (processed, Some(err)),
            }
        }
    }

    /// Apply one mutation. Failures never propagate to the sender: unknown
    /// ids and I/O errors are logged and the stream moves on.
    fn apply(&self, msg: &WireMessage) {
        let Some(dir) = self.mappings.get(&msg.id) else {
            debug!(id = %msg.id, filename = %msg.filename, "message for unknown id, dropped");
            return;
        };
        if !is_plain_filename(&msg.filename) {
            warn!(filename = %msg.filename, "rejecting filename that leaves the mapped directory");
            return;
        }
        let target = dir.join(&msg.filename);

        match msg.kind {
            MessageKind::Change | MessageKind::Add => {
                let payload = msg.payload.as_deref().unwrap_or(&[]);
                match std::fs::write(&target, payload) {
                    Ok(()) => debug!(id = %msg.id, filename = %msg.filename, bytes = payload.len(), "updated"),
                    Err(err) => warn!(target = %target.display(), %err, "failed to write"),
                }
            }
            MessageKind::Remove => match std::fs::remove_file(&target) {
                Ok(()) => debug!(id = %msg.id, filename = %msg.filename, "removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(target = %target.display(), %err, "failed to remove"),
            },
        }
    }
}

/// A filename from the wire must stay inside its mapped directory: a single
/// normal path component, no separators, no `..`.
fn is_plain_filename(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::LogReload;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct CountingReload(Arc<AtomicUsize>);

    impl ReloadHandler for CountingReload {
        fn request_reload(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server_for(dir: &Path) -> ContentServer {
        let mut mappings = HashMap::new();
        mappings.insert("ui".to_string(), dir.to_path_buf());
        ContentServer::new(mappings, Arc::new(LogReload))
    }

    #[test]
    fn test_apply_write_creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        server.apply(&WireMessage::add("ui", "a.qml", &b"first"[..]));
        assert_eq!(fs::read(dir.path().join("a.qml")).unwrap(), b"first");

        server.apply(&WireMessage::change("ui", "a.qml", &b"second"[..]));
        assert_eq!(fs::read(dir.path().join("a.qml")).unwrap(), b"second");
    }

    #[test]
    fn test_apply_remove_deletes_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());
        fs::write(dir.path().join("b.png"), [1u8]).unwrap();

        server.apply(&WireMessage::remove("ui", "b.png"));
        assert!(!dir.path().join("b.png").exists());

        // Absence is not an error.
        server.apply(&WireMessage::remove("ui", "b.png"));
    }

    #[test]
    fn test_apply_unknown_id_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        server.apply(&WireMessage::add("nope", "a.qml", &b"x"[..]));
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_apply_rejects_escaping_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        server.apply(&WireMessage::add("ui", "../escape.qml", &b"x"[..]));
        server.apply(&WireMessage::add("ui", "sub/dir.qml", &b"x"[..]));
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_drain_keeps_incomplete_tail_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&WireMessage::add("ui", "one.js", &b"1"[..]).encode());
        buf.extend_from_slice(&WireMessage::remove("ui", "gone.js").encode());
        let third = WireMessage::add("ui", "two.js", &b"2"[..]).encode();
        buf.extend_from_slice(&third[..third.len() - 3]);

        let (processed, error) = server.drain_messages(&mut buf);
        assert_eq!(processed, 2);
        assert!(error.is_none());
        assert_eq!(buf.len(), third.len() - 3);

        // The rest of the third message arrives.
        buf.extend_from_slice(&third[third.len() - 3..]);
        let (processed, error) = server.drain_messages(&mut buf);
        assert_eq!(processed, 1);
        assert!(error.is_none());
        assert!(buf.is_empty());
        assert_eq!(fs::read(dir.path().join("two.js")).unwrap(), b"2");
    }

    #[test]
    fn test_drain_surfaces_protocol_errors() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&99i32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let (processed, error) = server.drain_messages(&mut buf);
        assert_eq!(processed, 0);
        assert!(error.is_some());
    }

    #[test]
    fn test_drain_counts_messages_applied_before_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&WireMessage::add("ui", "good.qml", &b"Item {}"[..]).encode());
        buf.extend_from_slice(&99i32.to_be_bytes());

        let (processed, error) = server.drain_messages(&mut buf);
        assert_eq!(processed, 1);
        assert!(error.is_some());
        assert_eq!(fs::read(dir.path().join("good.qml")).unwrap(), b"Item {}");
    }

    async fn start_server(dir: &Path) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let reloads = Arc::new(AtomicUsize::new(0));
        let mut mappings = HashMap::new();
        mappings.insert("ui".to_string(), dir.to_path_buf());
        let server = ContentServer::new(
            mappings,
            Arc::new(CountingReload(Arc::clone(&reloads))),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.run(listener));
        (addr, reloads)
    }

    async fn wait_for_file(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("file never appeared: {}", path.display());
    }

    #[tokio::test]
    async fn test_burst_of_writes_coalesces_to_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, reloads) = start_server(dir.path()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut burst = BytesMut::new();
        for i in 0..5 {
            let msg = WireMessage::add("ui", format!("f{i}.qml"), &b"Item {}"[..]);
            burst.extend_from_slice(&msg.encode());
        }
        client.write_all(&burst).await.unwrap();
        client.flush().await.unwrap();

        wait_for_file(&dir.path().join("f4.qml")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        // The pending flag cleared once the reload ran, so a later burst
        // schedules a fresh one.
        let msg = WireMessage::change("ui", "f0.qml", &b"Item { }"[..]);
        client.write_all(&msg.encode()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reload_fires_for_writes_before_a_corrupt_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, reloads) = start_server(dir.path()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&WireMessage::add("ui", "good.qml", &b"Item {}"[..]).encode());
        bytes.extend_from_slice(&99i32.to_be_bytes());
        client.write_all(&bytes).await.unwrap();

        wait_for_file(&dir.path().join("good.qml")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        // The corrupt frame still costs the connection.
        let mut probe = [0u8; 1];
        let n = client.read(&mut probe).await.unwrap();
        assert_eq!(n, 0, "connection should be dropped after the corrupt frame");
    }

    #[tokio::test]
    async fn test_second_connection_rejected_first_unaffected() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _reloads) = start_server(dir.path()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The second connection is accepted and immediately dropped.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut probe = [0u8; 1];
        let n = second.read(&mut probe).await.unwrap();
        assert_eq!(n, 0, "second connection should see EOF");

        // The first connection keeps working.
        let msg = WireMessage::add("ui", "alive.qml", &b"Item {}"[..]);
        first.write_all(&msg.encode()).await.unwrap();
        wait_for_file(&dir.path().join("alive.qml")).await;
    }

    #[tokio::test]
    async fn test_disconnect_discards_partial_message() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _reloads) = start_server(dir.path()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let encoded = WireMessage::add("ui", "partial.qml", &b"Item {}"[..]).encode();
        client.write_all(&encoded[..encoded.len() - 4]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!dir.path().join("partial.qml").exists());

        // A fresh connection starts from a clean buffer.
        let mut next = TcpStream::connect(addr).await.unwrap();
        let msg = WireMessage::add("ui", "clean.qml", &b"Item {}"[..]);
        next.write_all(&msg.encode()).await.unwrap();
        wait_for_file(&dir.path().join("clean.qml")).await;
    }
}
