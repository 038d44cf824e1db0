/// mpv playback collaborator.
///
/// ```text
///   MpvPlayback (Playback trait, non-blocking)
///         │  PlayerCommand via mpsc
///         ▼
///   player_task ── owns MpvDriver (child process + IPC handle)
///                      ├── writer task  ← MpvRequest → socket
///                      └── reader task  → replies matched by request_id
/// ```
///
/// mpv is spawned lazily on the first `loadfile` and respawned if it dies.
/// The core never waits on mpv: commands are queued and failures only logged.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use moe_proto::platform;

use crate::collaborators::Playback;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct MpvRequest {
    req_id: u64,
    /// Serialised JSON line, newline included.
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

// ── IPC handle ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<MpvRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MpvRequest {
                req_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", volume.min(100)]))
            .await?;
        Ok(())
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W) -> MpvHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<MpvRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending));
    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("[mpv] reader: connection closed");
                fail_all(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("[mpv] reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };
                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    // Unsolicited event; playback state is not tracked here.
                    debug!("[mpv] event {}", trimmed);
                    continue;
                };
                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("[mpv] reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = match val.get("error").and_then(Value::as_str) {
                    Some("success") => Ok(val),
                    other => Err(anyhow::anyhow!(
                        "mpv error: {}",
                        other.unwrap_or("unknown error")
                    )),
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("[mpv] reader: read error: {}", e);
                fail_all(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<MpvRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("[mpv] send req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("[mpv] write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("[mpv] writer task exiting");
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child and its IPC handle.  Volume is remembered so a
/// respawned player starts at the current level.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    handle: Option<MpvHandle>,
    volume: u8,
}

impl MpvDriver {
    pub fn new(volume: u8) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
            handle: None,
            volume: volume.min(100),
        }
    }

    fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Current handle, dropped if the process has exited.
    fn live_handle(&mut self) -> Option<MpvHandle> {
        if !self.process_alive() {
            if self.handle.take().is_some() {
                warn!("[mpv] process exited");
            }
            return None;
        }
        self.handle.clone()
    }

    async fn ensure_connected(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        let handle = self.spawn_and_connect().await?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn apply(&mut self, cmd: PlayerCommand) -> anyhow::Result<()> {
        match cmd {
            PlayerCommand::Source(Some(url)) => {
                let handle = self.ensure_connected().await?;
                info!("[mpv] loading {}", url);
                handle.load_stream(&url).await?;
                handle.set_volume(self.volume).await?;
            }
            PlayerCommand::Source(None) => {
                if let Some(handle) = self.live_handle() {
                    info!("[mpv] stopping");
                    handle.stop().await?;
                }
            }
            PlayerCommand::Volume(volume) => {
                self.volume = volume.min(100);
                if let Some(handle) = self.live_handle() {
                    handle.set_volume(self.volume).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn kill(&mut self) {
        self.handle = None;
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("[mpv] spawning {:?}", mpv_binary);

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(format!("--volume={}", self.volume))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    async fn spawn_and_connect(&mut self) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        let stream = UnixStream::connect(&socket_path).await?;
        info!("[mpv] connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half))
    }

    #[cfg(windows)]
    async fn spawn_and_connect(&mut self) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("[mpv] connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

// ── Playback collaborator ─────────────────────────────────────────────────────

#[derive(Debug)]
enum PlayerCommand {
    Source(Option<String>),
    Volume(u8),
}

pub struct MpvPlayback {
    tx: mpsc::Sender<PlayerCommand>,
}

impl MpvPlayback {
    pub fn spawn(initial_volume: u8) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(player_task(rx, MpvDriver::new(initial_volume)));
        Self { tx }
    }

    fn enqueue(&self, cmd: PlayerCommand) {
        if let Err(e) = self.tx.try_send(cmd) {
            warn!("[mpv] dropping command: {}", e);
        }
    }
}

impl Playback for MpvPlayback {
    fn set_source(&self, url: Option<&str>) {
        self.enqueue(PlayerCommand::Source(url.map(str::to_owned)));
    }

    fn set_volume(&self, volume: u8) {
        self.enqueue(PlayerCommand::Volume(volume));
    }
}

async fn player_task(mut rx: mpsc::Receiver<PlayerCommand>, mut driver: MpvDriver) {
    while let Some(cmd) = rx.recv().await {
        debug!("[mpv] {:?}", cmd);
        if let Err(e) = driver.apply(cmd).await {
            warn!("[mpv] {}", e);
        }
    }
    driver.kill().await;
    debug!("[mpv] player task exiting");
}
