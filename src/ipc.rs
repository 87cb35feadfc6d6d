//! Control channel between the CLI and the resident supervising process.
//!
//! Every request is one JSON line carrying the control credentials and a command; the
//! reply is one JSON line. The channel runs over a Unix socket or a loopback TCP port,
//! whichever the manifest names.
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    constants::CONTROL_IO_TIMEOUT,
    manifest::{ControlCredentials, ControlSettings},
    status::ProgramStatus,
};

/// Address of the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEndpoint {
    /// Unix-domain socket path.
    Unix(PathBuf),
    /// `host:port` on the loopback interface.
    Tcp(String),
}

impl ControlEndpoint {
    /// Parses `unix:///path` or `http://host:port`.
    pub fn from_url(url: &str) -> Result<Self, ControlError> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ControlError::InvalidEndpoint(url.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let address = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("tcp://"))
            .unwrap_or(url)
            .trim_end_matches('/');
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(address.to_string()))
            }
            _ => Err(ControlError::InvalidEndpoint(url.to_string())),
        }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(address) => write!(f, "http://{address}"),
        }
    }
}

/// Which programs a command applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    All,
    Program(String),
}

impl Target {
    /// `all` maps to every program, anything else to one program.
    pub fn parse(name: &str) -> Self {
        if name == "all" {
            Self::All
        } else {
            Self::Program(name.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Program(name) => write!(f, "{name}"),
        }
    }
}

/// Message sent from CLI invocations to the supervising process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Start { target: Target },
    Stop { target: Target },
    Restart { target: Target },
    Signal { target: Target, signal: String },
    Status { names: Vec<String> },
    /// Last `lines` lines of a program log, or all of them for `None`.
    Tail { name: String, lines: Option<usize> },
    Shutdown,
}

/// A command plus the credentials that authorize it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub username: String,
    pub password: String,
    pub command: ControlCommand,
}

impl ControlRequest {
    /// Whether the request carries exactly these credentials.
    pub fn is_authorized(&self, credentials: &ControlCredentials) -> bool {
        self.username == credentials.username && self.password == credentials.password
    }
}

/// Response sent by the supervising process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(Vec<ProgramStatus>),
    Log { path: PathBuf, lines: Vec<String> },
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("control endpoint {0} not available")]
    NotAvailable(String),
    #[error("invalid control endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Connected control stream over either transport.
pub enum ControlStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ControlStream {
    /// Connects to the endpoint; reads and writes give up after `timeout`.
    pub fn connect(endpoint: &ControlEndpoint, timeout: Duration) -> Result<Self, ControlError> {
        let stream = match endpoint {
            ControlEndpoint::Unix(path) => {
                if !path.exists() {
                    return Err(ControlError::NotAvailable(endpoint.to_string()));
                }
                Self::Unix(UnixStream::connect(path)?)
            }
            ControlEndpoint::Tcp(address) => Self::Tcp(TcpStream::connect(address.as_str())?),
        };
        stream.set_timeouts(timeout)?;
        Ok(stream)
    }

    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
            Self::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
        }
    }

    fn set_blocking(&self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.set_nonblocking(false),
            Self::Tcp(s) => s.set_nonblocking(false),
        }
    }
}

impl Read for ControlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for ControlStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Listening side of the control channel, polled without blocking.
pub enum ControlListener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl ControlListener {
    /// Binds the endpoint, replacing a stale socket file.
    pub fn bind(endpoint: &ControlEndpoint) -> Result<Self, ControlError> {
        let listener = match endpoint {
            ControlEndpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if path.exists() {
                    fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Self::Unix(listener, path.clone())
            }
            ControlEndpoint::Tcp(address) => {
                let listener = TcpListener::bind(address.as_str())?;
                listener.set_nonblocking(true)?;
                Self::Tcp(listener)
            }
        };
        Ok(listener)
    }

    /// Returns a connected client, or `None` when nobody is waiting.
    pub fn try_accept(&self) -> io::Result<Option<ControlStream>> {
        let accepted = match self {
            Self::Unix(listener, _) => listener.accept().map(|(s, _)| ControlStream::Unix(s)),
            Self::Tcp(listener) => listener.accept().map(|(s, _)| ControlStream::Tcp(s)),
        };
        match accepted {
            Ok(stream) => {
                stream.set_blocking()?;
                stream.set_timeouts(CONTROL_IO_TIMEOUT)?;
                Ok(Some(stream))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Socket file to remove on shutdown, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(_, path) => Some(path),
            Self::Tcp(_) => None,
        }
    }
}

/// Sends a command to the supervising process and waits for a response.
pub fn send_command(
    settings: &ControlSettings,
    command: ControlCommand,
) -> Result<ControlResponse, ControlError> {
    send_command_within(settings, command, CONTROL_IO_TIMEOUT)
}

/// Like [`send_command`], waiting up to `timeout` for the reply. Stopping programs
/// can take their whole stop budget before the supervisor answers.
pub fn send_command_within(
    settings: &ControlSettings,
    command: ControlCommand,
    timeout: Duration,
) -> Result<ControlResponse, ControlError> {
    let mut stream = ControlStream::connect(&settings.endpoint, timeout)?;
    let request = ControlRequest {
        username: settings.credentials.username.clone(),
        password: settings.credentials.password.clone(),
        command,
    };
    let payload = serde_json::to_vec(&request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable(settings.endpoint.to_string()));
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads one request from a connected client. Used by the supervisor event loop.
pub fn read_request(stream: &mut ControlStream) -> Result<ControlRequest, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control request",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected client.
pub fn write_response(
    stream: &mut ControlStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
