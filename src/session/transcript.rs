//! Per-call transcript files.
//!
//! One append-only file per call, framed by header and footer lines; between
//! them, raw modem-to-user bytes exactly as received. No rotation and no
//! size cap: transcripts are bounded by call duration.

use chrono::{Local, SecondsFormat};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct TranscriptLog {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl TranscriptLog {
    /// Create `{site}_{YYYYMMDD-HHMMSS}_{deviceBase}.log` under `log_dir`,
    /// creating the directory if missing, and write the header line.
    pub fn create(log_dir: &Path, site: &str, device: &Path) -> io::Result<Self> {
        if !log_dir.exists() {
            DirBuilder::new().recursive(true).mode(0o755).create(log_dir)?;
        }

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let device_base = device
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let path = log_dir.join(format!("{site}_{stamp}_{device_base}.log"));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)?;

        let header = format!(
            "=== Session: {} | Device: {} | Started: {} ===\n",
            site,
            device.display(),
            Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        file.write_all(header.as_bytes())?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wrap `inner` so every byte read out of it also lands in the log.
    pub fn tee<R: Read>(&self, inner: R) -> TeeReader<R> {
        TeeReader {
            inner,
            file: Arc::clone(&self.file),
        }
    }

    /// Write the footer and flush. The file handle itself closes when the
    /// last tee drops.
    pub fn close(self) -> io::Result<()> {
        let footer = format!(
            "\n=== Session ended: {} ===\n",
            Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let mut file = self.file.lock().unwrap();
        file.write_all(footer.as_bytes())?;
        file.flush()
    }
}

pub struct TeeReader<R> {
    inner: R,
    file: Arc<Mutex<File>>,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.file.lock().unwrap().write_all(&buf[..n])?;
        }
        Ok(n)
    }
}
