//! NSS key-log sink for TLS session secrets
//!
//! Lines are written in the `SSLKEYLOGFILE` format understood by Wireshark:
//! `<label> <client_random hex> <secret hex>`.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug)]
pub struct KeyLogWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl KeyLogWriter {
    /// Create (or truncate) the key-log file, owner read/write only
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let file = options.open(path)?;
        debug!("Writing TLS key log to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_line(label: &str, client_random: &[u8], secret: &[u8]) -> String {
    let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
    line.push_str(label);
    line.push(' ');
    for b in client_random {
        let _ = write!(line, "{:02x}", b);
    }
    line.push(' ');
    for b in secret {
        let _ = write!(line, "{:02x}", b);
    }
    line.push('\n');
    line
}

impl rustls::KeyLog for KeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format_line(label, client_random, secret);
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            debug!("Failed to write key log {}: {}", self.path.display(), e);
        }
    }
}
