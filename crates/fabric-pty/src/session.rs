use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::errors::ServerError;
use crate::models::{CreateSessionRequest, ServerEvent, SessionInfo};
use crate::screen::Screen;
use crate::state::AppState;

pub const MAX_SCROLLBACK: usize = 100_000;
const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const OUTPUT_CHANNEL_SIZE: usize = 1024;
/// How long the reader waits for the child to be reaped after its output closes.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

/// What a terminal socket receives from its session.
#[derive(Debug, Clone)]
pub enum PtyOutput {
    Data(String),
    Exit(Option<i32>),
}

struct PtySessionInner {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send>,
    exit_code: Option<i32>,
}

pub struct PtySession {
    pub id: String,
    inner: Mutex<PtySessionInner>,
    shell: String,
    args: Vec<String>,
    cwd: String,
    name: RwLock<String>,
    index: RwLock<usize>,
    created_at: f64,
    cols: RwLock<u16>,
    rows: RwLock<u16>,
    scrollback: RwLock<String>,
    output_tx: broadcast::Sender<PtyOutput>,
    input_tx: SyncSender<Vec<u8>>,
    metadata: RwLock<Option<serde_json::Value>>,
    screen: Mutex<Screen>,
    output_closed: AtomicBool,
}

/// Live process state read from the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub alive: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl PtySession {
    /// Open a PTY, spawn the command on it and start the writer thread.
    /// The returned reader must be driven by [`run_reader`].
    pub fn spawn(
        id: String,
        name: String,
        index: usize,
        request: &CreateSessionRequest,
    ) -> Result<(Arc<Self>, Box<dyn Read + Send>), ServerError> {
        if request.cols == 0 || request.rows == 0 {
            return Err(ServerError::InvalidRequest(
                "cols and rows must be positive".to_string(),
            ));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ServerError::PtySpawnError(e.to_string()))?;

        let cwd = request
            .cwd
            .clone()
            .or_else(|| std::env::var("HOME").ok())
            .unwrap_or_else(|| "/".to_string());

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.args(&request.args);
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("SHELL", &request.shell);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ServerError::PtySpawnError(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ServerError::PtySpawnError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ServerError::PtySpawnError(e.to_string()))?;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_SIZE);
        let (input_tx, input_rx) = sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_writer_thread(id.clone(), writer, input_rx);

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let session = Arc::new(PtySession {
            id,
            inner: Mutex::new(PtySessionInner {
                master: pair.master,
                child,
                exit_code: None,
            }),
            shell: request.shell.clone(),
            args: request.args.clone(),
            cwd,
            name: RwLock::new(name),
            index: RwLock::new(index),
            created_at,
            cols: RwLock::new(request.cols),
            rows: RwLock::new(request.rows),
            scrollback: RwLock::new(String::new()),
            output_tx,
            input_tx,
            metadata: RwLock::new(request.metadata.clone()),
            screen: Mutex::new(Screen::new(request.rows as usize, request.cols as usize)),
            output_closed: AtomicBool::new(false),
        });

        Ok((session, reader))
    }

    pub fn status(&self) -> ProcessStatus {
        let mut inner = self.inner.lock();
        let pid = inner.child.process_id();
        if inner.exit_code.is_none() {
            if let Ok(Some(status)) = inner.child.try_wait() {
                inner.exit_code = Some(i32::try_from(status.exit_code()).unwrap_or(1));
            }
        }
        ProcessStatus {
            alive: inner.exit_code.is_none(),
            pid,
            exit_code: inner.exit_code,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status().alive
    }

    pub fn to_info(&self) -> SessionInfo {
        let status = self.status();
        SessionInfo {
            id: self.id.clone(),
            name: self.name.read().clone(),
            index: *self.index.read(),
            shell: self.shell.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            cols: *self.cols.read(),
            rows: *self.rows.read(),
            created_at: self.created_at,
            alive: status.alive,
            pid: status.pid,
            exit_code: status.exit_code,
            metadata: self.metadata.read().clone(),
        }
    }

    /// Queue input for the writer thread. Blocks when the queue is full.
    pub fn write_input(&self, data: &[u8]) -> Result<(), ServerError> {
        if !self.is_alive() {
            return Err(ServerError::SessionExited(self.id.clone()));
        }
        if data.len() > 100 {
            debug!("[session:{}] Queueing large input: {} bytes", self.id, data.len());
        }
        self.input_tx.send(data.to_vec()).map_err(|e| {
            error!("[session:{}] Input channel send failed: {}", self.id, e);
            ServerError::SessionExited(self.id.clone())
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ServerError> {
        if cols == 0 || rows == 0 {
            return Err(ServerError::InvalidRequest(
                "cols and rows must be positive".to_string(),
            ));
        }
        self.inner
            .lock()
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ServerError::PtyError(format!("resize failed: {e}")))?;

        *self.cols.write() = cols;
        *self.rows.write() = rows;
        self.screen.lock().resize(rows as usize, cols as usize);
        Ok(())
    }

    pub fn kill(&self) {
        let mut inner = self.inner.lock();
        if inner.exit_code.is_some() {
            return;
        }
        if let Err(e) = inner.child.kill() {
            warn!("[session:{}] Failed to kill PTY process: {}", self.id, e);
        }
    }

    /// Append to the scrollback and fan out to subscribers in one step so a new
    /// subscriber sees each chunk exactly once.
    fn publish(&self, data: String) {
        let mut scrollback = self.scrollback.write();
        scrollback.push_str(&data);
        trim_scrollback(&mut scrollback);
        let _ = self.output_tx.send(PtyOutput::Data(data));
    }

    /// Current scrollback plus a receiver for everything after it.
    pub fn subscribe(&self) -> (String, broadcast::Receiver<PtyOutput>) {
        let scrollback = self.scrollback.read();
        (scrollback.clone(), self.output_tx.subscribe())
    }

    pub fn scrollback(&self) -> String {
        self.scrollback.read().clone()
    }

    /// True once the reader has drained the PTY and sent the exit frame.
    pub fn output_closed(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status().exit_code
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub fn index(&self) -> usize {
        *self.index.read()
    }

    pub fn set_index(&self, index: usize) {
        *self.index.write() = index;
    }

    pub fn set_metadata(&self, metadata: Option<serde_json::Value>) {
        *self.metadata.write() = metadata;
    }

    pub fn metadata(&self) -> Option<serde_json::Value> {
        self.metadata.read().clone()
    }

    pub fn screen_lines(&self, viewport_only: bool) -> Vec<String> {
        let screen = self.screen.lock();
        if viewport_only {
            screen.viewport_lines()
        } else {
            screen.lines()
        }
    }

    fn process_screen(&self, data: &[u8]) {
        self.screen.lock().process(data);
    }
}

fn trim_scrollback(scrollback: &mut String) {
    if scrollback.len() <= MAX_SCROLLBACK {
        return;
    }
    let mut start = scrollback.len() - MAX_SCROLLBACK;
    while start < scrollback.len() && !scrollback.is_char_boundary(start) {
        start += 1;
    }
    scrollback.drain(..start);
}

/// Dedicated writer thread: input is written in small chunks so the PTY
/// buffer can drain between them.
fn spawn_writer_thread(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
    input_rx: Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        debug!("[writer:{}] Writer thread started", session_id);
        let mut total_bytes: usize = 0;

        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    // EIO once the child has gone away.
                    debug!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        session_id,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
                std::thread::yield_now();
            }
            total_bytes += data.len();
        }

        debug!(
            "[writer:{}] Writer thread finished. Total: {} bytes",
            session_id, total_bytes
        );
    });
}

/// Length of the longest prefix of `bytes` made of complete UTF-8 sequences.
/// Invalid bytes are passed through so lossy conversion can replace them.
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        // `error_len() == None` means the input ended mid-sequence.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let tail_start = bytes.len().saturating_sub(3);
            for start in (tail_start..bytes.len()).rev() {
                if bytes[start] & 0b1100_0000 != 0b1000_0000 {
                    if let Err(e) = std::str::from_utf8(&bytes[start..]) {
                        if e.error_len().is_none() {
                            return start;
                        }
                    }
                    break;
                }
            }
            bytes.len()
        }
    }
}

/// Pump PTY output into the session until the child's side closes, then
/// record the exit and announce it.
pub async fn run_reader(
    session: Arc<PtySession>,
    mut reader: Box<dyn Read + Send>,
    state: Arc<AppState>,
) {
    let session_id = session.id.clone();
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut total_bytes_read: usize = 0;

    debug!("[reader:{}] Reader task started", session_id);

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                error!("[reader:{}] spawn_blocking panicked: {}", session_id, e);
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => break,
            Ok(n) => {
                total_bytes_read += n;
                session.process_screen(&buf[..n]);

                pending.extend_from_slice(&buf[..n]);
                let valid_up_to = find_utf8_boundary(&pending);
                if valid_up_to > 0 {
                    let data = String::from_utf8_lossy(&pending[..valid_up_to]).into_owned();
                    session.publish(data);
                    pending.drain(..valid_up_to);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // Linux reports a closed slave side as EIO.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break,
            Err(e) => {
                error!(
                    "[reader:{}] Read error: {} (kind: {:?}, errno: {:?})",
                    session_id,
                    e,
                    e.kind(),
                    e.raw_os_error()
                );
                break;
            }
        }
    }

    if !pending.is_empty() {
        session.publish(String::from_utf8_lossy(&pending).into_owned());
    }

    let exit_code = wait_for_exit(&session).await;
    info!(
        "[reader:{}] Output closed after {} bytes, exit code {:?}",
        session_id, total_bytes_read, exit_code
    );

    session.output_closed.store(true, Ordering::SeqCst);
    let _ = session.output_tx.send(PtyOutput::Exit(exit_code));

    // A deleted session has already been announced.
    if state.contains(&session) {
        state.broadcast_event(ServerEvent::PtyExited {
            pty_id: session_id,
            exit_code,
        });
    }
}

async fn wait_for_exit(session: &PtySession) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + EXIT_STATUS_WAIT;
    loop {
        if let Some(code) = session.exit_code() {
            return Some(code);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Overlay `changes` on `current`; `null` values remove keys. Non-object
/// values replace the metadata outright.
pub fn merge_metadata(
    current: Option<serde_json::Value>,
    changes: serde_json::Value,
) -> Option<serde_json::Value> {
    use serde_json::Value;

    match (current, changes) {
        (_, Value::Null) => None,
        (Some(Value::Object(mut base)), Value::Object(changes)) => {
            for (key, value) in changes {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    base.insert(key, value);
                }
            }
            Some(Value::Object(base))
        }
        (_, Value::Object(changes)) => Some(Value::Object(
            changes.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        )),
        (_, other) => Some(other),
    }
}

/// Map of changed fields for a `pty_updated` event.
pub type Changes = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh_request() -> CreateSessionRequest {
        CreateSessionRequest {
            shell: "/bin/sh".to_string(),
            cwd: Some("/tmp".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn utf8_boundary_holds_back_partial_sequences() {
        assert_eq!(find_utf8_boundary(b""), 0);
        assert_eq!(find_utf8_boundary(b"plain"), 5);

        let check = "✓".as_bytes();
        let mut partial = b"ok ".to_vec();
        partial.extend_from_slice(&check[..2]);
        assert_eq!(find_utf8_boundary(&partial), 3);

        // Invalid bytes are not held back forever.
        assert_eq!(find_utf8_boundary(b"a\xffb"), 3);
        let mut invalid_then_partial = b"a\xff".to_vec();
        invalid_then_partial.extend_from_slice(&check[..1]);
        assert_eq!(find_utf8_boundary(&invalid_then_partial), 2);
    }

    #[test]
    fn scrollback_trims_on_char_boundary() {
        let mut scrollback = "é".repeat(MAX_SCROLLBACK);
        trim_scrollback(&mut scrollback);
        assert!(scrollback.len() <= MAX_SCROLLBACK);
        assert!(scrollback.chars().all(|c| c == 'é'));
    }

    #[test]
    fn metadata_merges_and_removes_keys() {
        let merged = merge_metadata(
            Some(json!({"location": "editor", "managed": true})),
            json!({"managed": null, "type": "agent"}),
        );
        assert_eq!(merged, Some(json!({"location": "editor", "type": "agent"})));
        assert_eq!(merge_metadata(Some(json!({"a": 1})), json!(null)), None);
        assert_eq!(merge_metadata(None, json!({"a": null, "b": 2})), Some(json!({"b": 2})));
        assert_eq!(merge_metadata(Some(json!({"a": 1})), json!("tag")), Some(json!("tag")));
    }

    #[tokio::test]
    async fn scrollback_limit() {
        let (session, _reader) =
            PtySession::spawn("limit".into(), "sh 1".into(), 0, &sh_request()).unwrap();

        session.publish("x".repeat(MAX_SCROLLBACK + 10_000));
        let scrollback = session.scrollback();
        assert_eq!(scrollback.len(), MAX_SCROLLBACK);

        session.kill();
    }

    #[tokio::test]
    async fn rejects_zero_dimensions() {
        let request = CreateSessionRequest {
            cols: 0,
            ..sh_request()
        };
        let err = PtySession::spawn("zero".into(), "sh 1".into(), 0, &request)
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn large_input_and_resize_during_activity() {
        let state = Arc::new(AppState::new());
        let (session, reader) =
            PtySession::spawn("busy".into(), "sh 1".into(), 0, &sh_request()).unwrap();
        tokio::spawn(run_reader(session.clone(), reader, state));
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.write_input("a".repeat(10_000).as_bytes()).unwrap();
        for i in 0..20u16 {
            session
                .write_input(format!("echo line{i}\n").as_bytes())
                .unwrap();
            session.resize(80 + i % 40, 24 + i % 10).unwrap();
        }
        assert_eq!(session.to_info().cols, 80 + 19 % 40);

        session.kill();
    }

    #[tokio::test]
    async fn output_reaches_scrollback_and_screen() {
        let state = Arc::new(AppState::new());
        let (session, reader) =
            PtySession::spawn("echo".into(), "sh 1".into(), 0, &sh_request()).unwrap();
        let (_, mut rx) = session.subscribe();
        tokio::spawn(run_reader(session.clone(), reader, state));

        session.write_input(b"echo fabric-$((40+2))\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !session.scrollback().contains("fabric-42") {
            assert!(tokio::time::Instant::now() < deadline, "no output");
            let _ = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        }
        assert!(session
            .screen_lines(false)
            .iter()
            .any(|line| line.contains("fabric-42")));

        session.kill();
    }

    #[tokio::test]
    async fn exit_is_recorded_and_input_rejected() {
        let state = Arc::new(AppState::new());
        let request = CreateSessionRequest {
            args: vec!["-c".into(), "exit 3".into()],
            ..sh_request()
        };
        let (session, reader) =
            PtySession::spawn("exit".into(), "sh 1".into(), 0, &request).unwrap();
        let (_, mut rx) = session.subscribe();
        tokio::spawn(run_reader(session.clone(), reader, state));

        let exit = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(PtyOutput::Exit(code)) => return code,
                    Ok(PtyOutput::Data(_)) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("channel closed: {e}"),
                }
            }
        })
        .await
        .expect("exit frame");

        assert_eq!(exit, Some(3));
        assert!(session.output_closed());
        let info = session.to_info();
        assert!(!info.alive);
        assert_eq!(info.exit_code, Some(3));
        assert!(matches!(
            session.write_input(b"ls\n"),
            Err(ServerError::SessionExited(_))
        ));
    }
}
