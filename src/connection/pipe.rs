//! Platform pipe abstraction (Windows named pipe vs Unix domain socket)

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, PipeEnd};
#[cfg(unix)]
use tokio::net::UnixStream;

/// Pipe the server listens on when none is configured
pub const DEFAULT_PIPE_NAME: &str = r"sql\query";

/// Prefix used to map pipe names onto socket files on Unix
#[cfg(unix)]
const UNIX_PIPE_PREFIX: &str = "CoreFxPipe_";

/// Server and pipe name identifying one pipe endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePath {
    server: String,
    name: String,
}

impl PipePath {
    /// Pipe `name` (e.g. `sql\query`) on `server`
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
        }
    }

    /// Server host part
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Pipe name below `\pipe\`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the server part names this machine
    pub fn is_local(&self) -> bool {
        let server = self.server.as_str();
        if server == "."
            || server.eq_ignore_ascii_case("localhost")
            || server.eq_ignore_ascii_case("(local)")
        {
            return true;
        }
        whoami::fallible::hostname()
            .map(|host| host.eq_ignore_ascii_case(server))
            .unwrap_or(false)
    }

    /// UNC form, `\\server\pipe\name`
    pub fn unc(&self) -> String {
        format!(r"\\{}\pipe\{}", self.server, self.name)
    }

    /// Socket file backing this pipe on Unix.
    ///
    /// Absolute names are used as-is; anything else lives in the temp
    /// directory under the `CoreFxPipe_` prefix.
    #[cfg(unix)]
    pub fn socket_path(&self) -> std::path::PathBuf {
        let name = std::path::Path::new(&self.name);
        if name.is_absolute() {
            return name.to_path_buf();
        }
        std::env::temp_dir().join(format!("{}{}", UNIX_PIPE_PREFIX, self.name))
    }
}

impl std::fmt::Display for PipePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.unc())
    }
}

/// Connected client end of a pipe
#[derive(Debug)]
pub enum PipeStream {
    /// Windows named pipe client
    #[cfg(windows)]
    NamedPipe(NamedPipeClient),
    /// Unix domain socket standing in for a named pipe
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PipeStream {
    /// Open the client end of `path`.
    ///
    /// No timeout is applied here; callers bound the wait.
    #[cfg(windows)]
    pub async fn connect(path: &PipePath) -> io::Result<Self> {
        open_named_pipe(&path.unc()).await.map(PipeStream::NamedPipe)
    }

    /// Open the client end of `path`.
    ///
    /// No timeout is applied here; callers bound the wait. Only local pipes
    /// can be reached.
    #[cfg(unix)]
    pub async fn connect(path: &PipePath) -> io::Result<Self> {
        if !path.is_local() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("remote pipe '{}' is not reachable from this platform", path),
            ));
        }
        UnixStream::connect(path.socket_path())
            .await
            .map(PipeStream::Unix)
    }

    /// Whether the pipe is open for both reading and writing
    pub fn is_duplex(&self) -> bool {
        match self {
            #[cfg(windows)]
            PipeStream::NamedPipe(client) => client
                .info()
                .map(|info| info.end == PipeEnd::Client)
                .unwrap_or(false),
            #[cfg(unix)]
            PipeStream::Unix(stream) => {
                stream.peer_addr().is_ok() && matches!(stream.take_error(), Ok(None))
            }
        }
    }
}

#[cfg(windows)]
async fn open_named_pipe(path: &str) -> io::Result<NamedPipeClient> {
    const ERROR_PIPE_BUSY: i32 = 231;
    const BUSY_RETRY: std::time::Duration = std::time::Duration::from_millis(50);

    loop {
        match ClientOptions::new().open(path) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tracing::debug!(pipe = path, "pipe busy, retrying");
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(BUSY_RETRY).await;
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(windows)]
            PipeStream::NamedPipe(client) => Pin::new(client).poll_read(cx, buf),
            #[cfg(unix)]
            PipeStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(windows)]
            PipeStream::NamedPipe(client) => Pin::new(client).poll_write(cx, buf),
            #[cfg(unix)]
            PipeStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(windows)]
            PipeStream::NamedPipe(client) => Pin::new(client).poll_flush(cx),
            #[cfg(unix)]
            PipeStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(windows)]
            PipeStream::NamedPipe(client) => Pin::new(client).poll_shutdown(cx),
            #[cfg(unix)]
            PipeStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unc_form() {
        let path = PipePath::new("db01", DEFAULT_PIPE_NAME);
        assert_eq!(path.unc(), r"\\db01\pipe\sql\query");
        assert_eq!(path.to_string(), r"\\db01\pipe\sql\query");
    }

    #[test]
    fn test_local_aliases() {
        assert!(PipePath::new(".", DEFAULT_PIPE_NAME).is_local());
        assert!(PipePath::new("LOCALHOST", DEFAULT_PIPE_NAME).is_local());
        assert!(PipePath::new("(local)", DEFAULT_PIPE_NAME).is_local());
        assert!(!PipePath::new("db.invalid", DEFAULT_PIPE_NAME).is_local());
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_path_mapping() {
        let path = PipePath::new(".", DEFAULT_PIPE_NAME);
        let expected = std::env::temp_dir().join(r"CoreFxPipe_sql\query");
        assert_eq!(path.socket_path(), expected);

        let absolute = PipePath::new(".", "/run/sqlserver/query.sock");
        assert_eq!(
            absolute.socket_path(),
            std::path::PathBuf::from("/run/sqlserver/query.sock")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_pipe_is_unsupported() {
        let path = PipePath::new("db.invalid", DEFAULT_PIPE_NAME);
        let err = PipeStream::connect(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let path = PipePath::new(".", "/nonexistent/npipe-wire/query.sock");
        assert!(PipeStream::connect(&path).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connected_pipe_is_duplex() {
        let socket = std::env::temp_dir().join(format!(
            "npipe-wire-duplex-{}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&socket);
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let path = PipePath::new(".", socket.to_string_lossy().into_owned());
        let (client, accepted) = tokio::join!(PipeStream::connect(&path), listener.accept());
        let client = client.unwrap();
        let _server = accepted.unwrap();

        assert!(client.is_duplex());
        let _ = std::fs::remove_file(&socket);
    }
}
