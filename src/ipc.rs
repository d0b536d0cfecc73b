//! Detach channel: a per-name IPC endpoint exposing the current action
//! string to peer processes.
//!
//! The server side is a spawned task owning a `tokio::net::UnixListener`;
//! it accepts connections as they arrive and, on every published action,
//! pushes `<action>\n` to each client, dropping the ones whose pipe broke.
//! The event loop publishes through a watch channel once per tick. Clients
//! stream until EOF. Unix sockets only; on other platforms the channel is
//! reported unsupported.

#[cfg(not(unix))]
use std::io;
use std::path::PathBuf;

pub fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name))
}

#[cfg(unix)]
pub use unix_impl::*;

#[cfg(unix)]
mod unix_impl {
    use super::socket_path;
    use std::io::{self, Write};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::watch;

    pub struct StatusServer {
        tx: watch::Sender<String>,
        clients: Arc<AtomicUsize>,
        task: tokio::task::JoinHandle<()>,
        path: PathBuf,
    }

    impl StatusServer {
        /// Bind `/tmp/<name>.sock`, replacing a leftover socket file from a
        /// dead instance, and spawn the broadcast task. Must be called from
        /// within a tokio runtime.
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = socket_path(name);
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            let (tx, rx) = watch::channel(String::new());
            let clients = Arc::new(AtomicUsize::new(0));
            let task = tokio::spawn(serve(listener, rx, clients.clone()));
            Ok(StatusServer {
                tx,
                clients,
                task,
                path,
            })
        }

        pub fn client_count(&self) -> usize {
            self.clients.load(Ordering::SeqCst)
        }

        /// Hand one line to the broadcast task for every attached client.
        pub fn publish(&self, message: &str) {
            let _ = self.tx.send(message.to_string());
        }
    }

    impl Drop for StatusServer {
        fn drop(&mut self) {
            self.task.abort();
            let _ = std::fs::remove_file(&self.path);
        }
    }

    async fn serve(
        listener: UnixListener,
        mut rx: watch::Receiver<String>,
        clients: Arc<AtomicUsize>,
    ) {
        let mut streams: Vec<UnixStream> = Vec::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, _)) = accepted {
                        streams.push(stream);
                        clients.store(streams.len(), Ordering::SeqCst);
                    }
                }
                changed = rx.changed() => {
                    // The sender lives in StatusServer; an error means the
                    // server was dropped.
                    if changed.is_err() {
                        break;
                    }
                    let payload = format!("{}\n", rx.borrow_and_update().clone());
                    let mut kept = Vec::with_capacity(streams.len());
                    for mut stream in streams.drain(..) {
                        if stream.write_all(payload.as_bytes()).await.is_ok() {
                            kept.push(stream);
                        }
                    }
                    streams = kept;
                    clients.store(streams.len(), Ordering::SeqCst);
                }
            }
        }
    }

    /// Client side: connect to a peer's channel and copy its stream to
    /// `out` until EOF.
    pub async fn attach_stream(name: &str, out: &mut (dyn Write + Send)) -> io::Result<()> {
        let mut stream = UnixStream::connect(socket_path(name)).await?;
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            out.write_all(&buf[..n])?;
            out.flush()?;
        }
    }
}

#[cfg(not(unix))]
pub struct StatusServer;

#[cfg(not(unix))]
impl StatusServer {
    pub fn bind(_name: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "detach channel requires unix sockets",
        ))
    }
    pub fn client_count(&self) -> usize {
        0
    }
    pub fn publish(&self, _message: &str) {}
}

#[cfg(not(unix))]
pub async fn attach_stream(_name: &str, _out: &mut (dyn io::Write + Send)) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "detach channel requires unix sockets",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    fn unique_name(tag: &str) -> String {
        format!("autogitpull-test-{}-{}", tag, std::process::id())
    }

    async fn wait_for_clients(server: &StatusServer, n: usize) {
        for _ in 0..500 {
            if server.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client count never reached {}", n);
    }

    #[tokio::test]
    async fn clients_receive_published_lines() {
        let name = unique_name("bcast");
        let server = StatusServer::bind(&name).unwrap();

        let mut client = UnixStream::connect(socket_path(&name)).await.unwrap();
        wait_for_clients(&server, 1).await;

        server.publish("Pulling alpha");
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Pulling alpha\n");
    }

    #[tokio::test]
    async fn broken_clients_are_dropped() {
        let name = unique_name("drop");
        let server = StatusServer::bind(&name).unwrap();
        let client = UnixStream::connect(socket_path(&name)).await.unwrap();
        wait_for_clients(&server, 1).await;
        drop(client);
        // The first publish may land in the dead socket's buffer; keep
        // publishing until the broken pipe surfaces.
        for _ in 0..50 {
            server.publish("tick");
            if server.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_drop() {
        let name = unique_name("cleanup");
        let path = socket_path(&name);
        {
            let _server = StatusServer::bind(&name).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_files_are_replaced() {
        let name = unique_name("stale");
        std::fs::write(socket_path(&name), b"junk").unwrap();
        let server = StatusServer::bind(&name);
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn attach_streams_until_eof() {
        let name = unique_name("attach");
        let server = StatusServer::bind(&name).unwrap();
        let reader = tokio::spawn({
            let name = name.clone();
            async move {
                let mut out = Vec::new();
                attach_stream(&name, &mut out).await.unwrap();
                out
            }
        });
        wait_for_clients(&server, 1).await;
        server.publish("Idle");
        // Let the broadcast land before hanging up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(server);
        let out = reader.await.unwrap();
        assert_eq!(out, b"Idle\n");
    }
}
