//! Tor overlay driven as a child process.
//!
//! # Responsibilities
//! - Write a `torrc` into the data directory and launch `tor`
//! - Wait for `Bootstrapped 100%` on its log output
//! - Publish hidden services over the control port (`ADD_ONION`)
//! - Persist each service key under `data_dir/<service_id>` so the onion
//!   address survives restarts
//!
//! # Design Decisions
//! - The control connection is kept open for the life of the instance;
//!   services added through it disappear when it closes
//! - tor's stdout is drained for as long as the process runs, otherwise a
//!   full pipe would stall it
//! - `kill_on_drop` guarantees the process never outlives the instance

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{HiddenListener, HiddenServiceSpec, OverlayBootstrapError, OverlayInstance, OverlayNetwork};

const BOOTSTRAPPED: &str = "Bootstrapped 100%";
const CONTROL_PORT_FILE: &str = "control-port";
const COOKIE_FILE: &str = "control_auth_cookie";
const KEY_FILE: &str = "onion_key";
const CONTROL_PORT_POLL: Duration = Duration::from_millis(100);
const CONTROL_PORT_ATTEMPTS: u32 = 100;

/// Launches a private `tor` process.
#[derive(Debug, Clone)]
pub struct TorProcessOverlay {
    binary: PathBuf,
}

impl TorProcessOverlay {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn launch(&self, data_dir: &Path) -> Result<Arc<dyn OverlayInstance>, OverlayBootstrapError> {
        let data_dir = absolute(data_dir)?;
        tokio::fs::create_dir_all(data_dir.join("data"))
            .await
            .map_err(|source| OverlayBootstrapError::DataDir {
                path: data_dir.clone(),
                source,
            })?;
        // A stale port file from a previous run would point at a dead process.
        let _ = tokio::fs::remove_file(data_dir.join(CONTROL_PORT_FILE)).await;

        let torrc = data_dir.join("torrc");
        tokio::fs::write(&torrc, render_torrc(&data_dir))
            .await
            .map_err(|source| OverlayBootstrapError::DataDir {
                path: torrc.clone(),
                source,
            })?;

        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg(&torrc)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OverlayBootstrapError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        tracing::debug!(pid = child.id(), torrc = %torrc.display(), "tor launched");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OverlayBootstrapError::Exited("no stdout".to_string()))?;
        let log_task = wait_for_bootstrap(stdout).await?;

        let control = ControlConnection::connect(&data_dir).await?;
        Ok(Arc::new(TorInstance {
            data_dir,
            child: Mutex::new(Some(child)),
            control: Mutex::new(Some(control)),
            log_task,
        }))
    }
}

impl OverlayNetwork for TorProcessOverlay {
    fn name(&self) -> &'static str {
        "tor"
    }

    fn bootstrap<'a>(
        &'a self,
        data_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn OverlayInstance>, OverlayBootstrapError>> {
        Box::pin(self.launch(data_dir))
    }
}

fn absolute(path: &Path) -> Result<PathBuf, OverlayBootstrapError> {
    std::path::absolute(path).map_err(|source| OverlayBootstrapError::DataDir {
        path: path.to_path_buf(),
        source,
    })
}

fn render_torrc(data_dir: &Path) -> String {
    format!(
        "DataDirectory {data}\n\
         SocksPort 0\n\
         ControlPort auto\n\
         ControlPortWriteToFile {port_file}\n\
         CookieAuthentication 1\n\
         CookieAuthFile {cookie}\n\
         Log notice stdout\n",
        data = data_dir.join("data").display(),
        port_file = data_dir.join(CONTROL_PORT_FILE).display(),
        cookie = data_dir.join(COOKIE_FILE).display(),
    )
}

/// Read tor's log until it reports a full bootstrap, then keep draining it.
async fn wait_for_bootstrap(stdout: ChildStdout) -> Result<JoinHandle<()>, OverlayBootstrapError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut last = String::new();
    loop {
        match lines.next_line().await? {
            Some(line) => {
                tracing::debug!(target: "hidden_gateway::overlay::tor", "{line}");
                if line.contains(BOOTSTRAPPED) {
                    break;
                }
                last = line;
            }
            None => return Err(OverlayBootstrapError::Exited(last)),
        }
    }

    Ok(tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "hidden_gateway::overlay::tor", "{line}");
        }
    }))
}

/// Parse `PORT=127.0.0.1:9051` as written by `ControlPortWriteToFile`.
fn parse_control_port(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .map(str::to_string)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Authenticated control-port session.
struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    async fn connect(data_dir: &Path) -> Result<Self, OverlayBootstrapError> {
        let port_file = data_dir.join(CONTROL_PORT_FILE);
        let mut address = None;
        for _ in 0..CONTROL_PORT_ATTEMPTS {
            if let Ok(contents) = tokio::fs::read_to_string(&port_file).await {
                address = parse_control_port(&contents);
                if address.is_some() {
                    break;
                }
            }
            tokio::time::sleep(CONTROL_PORT_POLL).await;
        }
        let address = address.ok_or_else(|| {
            OverlayBootstrapError::Publish(format!("{} was never written", port_file.display()))
        })?;

        let cookie = tokio::fs::read(data_dir.join(COOKIE_FILE)).await?;
        let (read, writer) = TcpStream::connect(&address).await?.into_split();
        let mut control = Self {
            reader: BufReader::new(read),
            writer,
        };
        control
            .command(&format!("AUTHENTICATE {}", hex(&cookie)))
            .await?;
        tracing::debug!(address = %address, "tor control port authenticated");
        Ok(control)
    }

    /// Send one command and collect its reply lines (status code stripped).
    async fn command(&mut self, line: &str) -> Result<Vec<String>, OverlayBootstrapError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut replies = Vec::new();
        loop {
            let mut reply = String::new();
            if self.reader.read_line(&mut reply).await? == 0 {
                return Err(OverlayBootstrapError::Publish("control port closed".to_string()));
            }
            let reply = reply.trim_end();
            let (status, rest) = reply.split_at(reply.len().min(3));
            if status != "250" {
                return Err(OverlayBootstrapError::Publish(reply.to_string()));
            }
            let (separator, text) = rest.split_at(rest.len().min(1));
            replies.push(text.to_string());
            if separator == " " {
                return Ok(replies);
            }
        }
    }
}

/// Write the service key readable by the owner only.
async fn store_key(key_dir: &Path, key_file: &Path, key: &str) -> std::io::Result<()> {
    let mut dir = tokio::fs::DirBuilder::new();
    dir.recursive(true);
    #[cfg(unix)]
    dir.mode(0o700);
    dir.create(key_dir).await?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(key_file).await?;
    file.write_all(key.as_bytes()).await?;
    file.flush().await?;

    // `mode` only applies on creation; tighten anything left by an older run.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(key_dir, std::fs::Permissions::from_mode(0o700)).await?;
        tokio::fs::set_permissions(key_file, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

struct TorInstance {
    data_dir: PathBuf,
    child: Mutex<Option<Child>>,
    control: Mutex<Option<ControlConnection>>,
    log_task: JoinHandle<()>,
}

impl TorInstance {
    async fn publish(&self, spec: &HiddenServiceSpec) -> Result<HiddenListener, OverlayBootstrapError> {
        let listener = TcpListener::bind(("127.0.0.1", spec.local_port))
            .await
            .map_err(|source| OverlayBootstrapError::Listen {
                port: spec.local_port,
                source,
            })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| OverlayBootstrapError::Listen {
                port: spec.local_port,
                source,
            })?
            .port();

        let key_dir = self.data_dir.join(&spec.service_id);
        let key_file = key_dir.join(KEY_FILE);
        let stored_key = tokio::fs::read_to_string(&key_file).await.ok();
        let key = stored_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or("NEW:ED25519-V3");

        let mut control = self.control.lock().await;
        let control = control.as_mut().ok_or(OverlayBootstrapError::ShutDown)?;
        let replies = control
            .command(&format!(
                "ADD_ONION {key} Port={},127.0.0.1:{local_port}",
                spec.hidden_port
            ))
            .await?;

        let mut service_id = None;
        for reply in &replies {
            if let Some(id) = reply.strip_prefix("ServiceID=") {
                service_id = Some(id.to_string());
            } else if let Some(new_key) = reply.strip_prefix("PrivateKey=") {
                store_key(&key_dir, &key_file, new_key).await?;
                tracing::info!(path = %key_file.display(), "Hidden service key created");
            }
        }
        let address = service_id
            .map(|id| format!("{id}.onion"))
            .ok_or_else(|| OverlayBootstrapError::Publish("no ServiceID in reply".to_string()))?;

        tracing::info!(
            service = %spec.service_id,
            address = %address,
            hidden_port = spec.hidden_port,
            local_port,
            "Hidden service published"
        );
        Ok(HiddenListener {
            listener,
            address: Some(address),
        })
    }
}

impl OverlayInstance for TorInstance {
    fn open_hidden_listener<'a>(
        &'a self,
        spec: &'a HiddenServiceSpec,
    ) -> BoxFuture<'a, Result<HiddenListener, OverlayBootstrapError>> {
        Box::pin(self.publish(spec))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.control.lock().await.take();
            if let Some(mut child) = self.child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to stop tor");
                }
            }
            self.log_task.abort();
        })
    }
}
