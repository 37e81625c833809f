use axum::Json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::app::app_state;
use crate::ApiResponse;

pub const LOG_MAX_BYTES: u64 = 1_024 * 1_024; // 1MB
pub const LOG_MAX_ROTATED_FILES: usize = 5;
// 剩余磁盘空间低于该值时先清理旧日志，仍不足则停止写文件。
pub const LOG_MIN_FREE_SPACE_BYTES: u64 = LOG_MAX_BYTES;
pub const LOG_DISK_CHECK_INTERVAL_BYTES: u64 = 64 * 1_024;
const LOG_TAIL_LINES: usize = 200;

pub fn app_log_path(root: &Path) -> PathBuf {
    root.join("log").join("app.log")
}

pub fn kernel_log_path(root: &Path) -> PathBuf {
    root.join("log").join("kernel.log")
}

#[derive(Default)]
pub struct LogWriteState {
    pub logging_disabled: bool,
    pub bytes_since_last_disk_check: u64,
    pub warning_emitted: bool,
}

pub type SharedLogWriteState = Arc<Mutex<LogWriteState>>;

pub fn new_shared_log_write_state() -> SharedLogWriteState {
    Arc::new(Mutex::new(LogWriteState::default()))
}

fn effective_log_max_bytes(path: &Path) -> u64 {
    let mut max_bytes = LOG_MAX_BYTES;

    // 不超过剩余可用空间的 80%
    if let Some(parent) = path.parent() {
        if let Ok(free) = fs2::available_space(parent) {
            let cap = free.saturating_mul(80).saturating_div(100);
            if cap > 0 {
                max_bytes = max_bytes.min(cap);
            }
        }
    }

    max_bytes
}

/// Rolls `path` to `path.1`, `path.1` to `path.2` and so on once it grows
/// past the size cap. The oldest file beyond [`LOG_MAX_ROTATED_FILES`] is dropped.
pub fn rotate_log_file(path: &Path) -> std::io::Result<()> {
    use std::fs;
    use std::io::ErrorKind;

    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if meta.len() < effective_log_max_bytes(path) {
        return Ok(());
    }

    let base = path.to_string_lossy().to_string();
    for idx in (1..=LOG_MAX_ROTATED_FILES).rev() {
        let src = if idx == 1 {
            PathBuf::from(&base)
        } else {
            PathBuf::from(format!("{base}.{}", idx - 1))
        };
        if !src.exists() {
            continue;
        }
        let dst = PathBuf::from(format!("{base}.{idx}"));
        let _ = fs::remove_file(&dst);
        let _ = fs::rename(&src, &dst);
    }

    Ok(())
}

fn cleanup_rotated_logs(path: &Path) {
    let base = path.to_string_lossy().to_string();
    for idx in 1..=LOG_MAX_ROTATED_FILES {
        let rotated = PathBuf::from(format!("{base}.{idx}"));
        if rotated.exists() {
            let _ = std::fs::remove_file(&rotated);
        }
    }
}

/// Appends `buf` to the log at `path`, rotating first. When the disk runs low
/// the writer keeps accepting data but stops touching the file.
pub fn write_log_with_rotation_and_space_guard(
    path: &Path,
    state: &SharedLogWriteState,
    buf: &[u8],
    log_name: &str,
) -> std::io::Result<usize> {
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    {
        let mut inner = state.lock().expect("log state mutex poisoned");
        if inner.logging_disabled {
            return Ok(buf.len());
        }

        inner.bytes_since_last_disk_check = inner
            .bytes_since_last_disk_check
            .saturating_add(buf.len() as u64);

        if inner.bytes_since_last_disk_check >= LOG_DISK_CHECK_INTERVAL_BYTES {
            inner.bytes_since_last_disk_check = 0;
            drop(inner);

            let low_space = |parent: &Path| {
                fs2::available_space(parent).is_ok_and(|free| free < LOG_MIN_FREE_SPACE_BYTES)
            };
            if let Some(parent) = path.parent() {
                if low_space(parent) {
                    cleanup_rotated_logs(path);
                    if low_space(parent) {
                        let mut inner = state.lock().expect("log state mutex poisoned");
                        inner.logging_disabled = true;
                        if !inner.warning_emitted {
                            inner.warning_emitted = true;
                            drop(inner);
                            tracing::warn!(
                                "disabling {log_name} log file writing at {}: free space below {LOG_MIN_FREE_SPACE_BYTES} bytes",
                                path.display()
                            );
                        }
                        return Ok(buf.len());
                    }
                }
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = rotate_log_file(path);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write(buf)
}

/// Copies a child pipe into the log file line by line. Each line is also
/// forwarded to `lines` while the receiving side is still listening.
pub fn spawn_log_pipe_task<R>(
    reader: R,
    path: PathBuf,
    state: SharedLogWriteState,
    log_name: &'static str,
    direction: &'static str,
    lines: Option<UnboundedSender<String>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut reader = BufReader::new(reader).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    let mut record = line.clone().into_bytes();
                    record.push(b'\n');
                    if let Err(err) =
                        write_log_with_rotation_and_space_guard(&path, &state, &record, log_name)
                    {
                        tracing::warn!("failed to write {log_name} {direction} log: {err}");
                    }
                    if let Some(tx) = &lines {
                        // 接收端已关闭时只落盘
                        let _ = tx.send(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("failed to read {log_name} {direction}: {err}");
                    break;
                }
            }
        }
    })
}

pub fn read_log_tail(path: &Path, max_lines: usize) -> Result<Vec<String>, String> {
    use std::collections::VecDeque;
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err("log_not_found".to_string());
        }
        Err(err) => return Err(format!("failed to open log file {}: {err}", path.display())),
    };

    let mut ring: VecDeque<String> = VecDeque::with_capacity(max_lines);
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| format!("failed to read log file {}: {err}", path.display()))?;
        if ring.len() == max_lines {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    Ok(ring.into_iter().collect())
}

fn log_tail_response(path: &Path, label: &str) -> Json<ApiResponse<serde_json::Value>> {
    match read_log_tail(path, LOG_TAIL_LINES) {
        Ok(lines) => Json(ApiResponse::ok(serde_json::json!({ "lines": lines }))),
        Err(err) if err == "log_not_found" => {
            Json(ApiResponse::error("log_not_found", format!("{label} log not found")))
        }
        Err(err) => {
            tracing::error!("failed to read {label} log: {err}");
            Json(ApiResponse::error("log_read_failed", err))
        }
    }
}

pub async fn get_app_log() -> Json<ApiResponse<serde_json::Value>> {
    log_tail_response(&app_log_path(&app_state().data_root), "app")
}

pub async fn get_kernel_log() -> Json<ApiResponse<serde_json::Value>> {
    log_tail_response(&kernel_log_path(&app_state().data_root), "kernel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn oversized_log_is_rolled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, vec![b'x'; (LOG_MAX_BYTES + 1) as usize]).unwrap();
        std::fs::write(dir.path().join("app.log.1"), b"older").unwrap();

        rotate_log_file(&path).unwrap();

        assert!(!path.exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("app.log.1")).unwrap().len(),
            LOG_MAX_BYTES + 1
        );
        assert_eq!(std::fs::read(dir.path().join("app.log.2")).unwrap(), b"older");
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.log");
        std::fs::write(&path, b"line\n").unwrap();
        rotate_log_file(&path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("kernel.log.1").exists());
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let content: String = (0..10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();

        let tail = read_log_tail(&path, 3).unwrap();
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
        assert_eq!(
            read_log_tail(&dir.path().join("missing.log"), 3).unwrap_err(),
            "log_not_found"
        );
    }

    #[tokio::test]
    async fn pipe_task_writes_and_forwards_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("kernel.log");
        let (mut writer, reader) = tokio::io::duplex(256);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let task = spawn_log_pipe_task(
            reader,
            path.clone(),
            new_shared_log_write_state(),
            "kernel",
            "stdout",
            Some(tx),
        );
        writer.write_all(b"booting\nready\n").await.unwrap();
        drop(writer);
        task.await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("booting"));
        assert_eq!(rx.recv().await.as_deref(), Some("ready"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "booting\nready\n");
    }
}
