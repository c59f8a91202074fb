//! Chunked copying with progress, plus remote path and mode helpers.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Cumulative progress of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.transferred as f64 * 100.0 / self.total as f64
        }
    }
}

/// Copy `reader` into `writer` in `chunk_size` pieces, reporting after every chunk.
///
/// On failure returns the bytes written so far alongside the error, counting
/// the accepted part of a chunk that failed midway.
pub fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<u64, (u64, std::io::Error)>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(TransferProgress),
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut transferred: u64 = 0;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err((transferred, e)),
        };
        let mut written = 0;
        while written < n {
            match writer.write(&buf[written..n]) {
                Ok(0) => {
                    return Err((transferred + written as u64, std::io::Error::from(ErrorKind::WriteZero)))
                }
                Ok(k) => written += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err((transferred + written as u64, e)),
            }
        }
        transferred += n as u64;
        on_progress(TransferProgress {
            transferred,
            total: total.max(transferred),
        });
    }

    writer.flush().map_err(|e| (transferred, e))?;
    Ok(transferred)
}

/// Reject `..` segments and make relative paths absolute.
pub fn validate_remote_path(path: &str) -> EngineResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Resource("Remote path is empty".into()));
    }
    if trimmed.contains('\0') {
        return Err(EngineError::Resource("Remote path contains a NUL byte".into()));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(EngineError::Resource(format!(
            "Remote path '{}' must not contain '..'",
            trimmed
        )));
    }

    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}

/// Parse an octal mode such as `755` or `0644`.
pub fn parse_mode(mode: &str) -> EngineResult<u32> {
    let digits = mode.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    let invalid = || EngineError::Resource(format!("Invalid permission mode '{}'", mode));

    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| ('0'..='7').contains(&c)) {
        return Err(invalid());
    }
    u32::from_str_radix(digits, 8).map_err(|_| invalid())
}

/// Format file permissions as a string like "rwxr-xr-x", prefixed by the entry type
pub fn format_permissions(perm: u32, is_dir: bool, is_symlink: bool) -> String {
    let mut s = String::with_capacity(10);

    if is_dir {
        s.push('d');
    } else if is_symlink {
        s.push('l');
    } else {
        s.push('-');
    }

    for shift in [6, 3, 0] {
        let bits = (perm >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that fails once `limit` bytes have been accepted
    struct FailingWriter {
        written: Vec<u8>,
        limit: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.written.len() >= self.limit {
                return Err(std::io::Error::new(ErrorKind::BrokenPipe, "connection reset"));
            }
            let n = buf.len().min(self.limit - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_copy_is_byte_identical_with_final_progress() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let mut reports = Vec::new();

        let copied = copy_with_progress(
            &mut Cursor::new(&data),
            &mut out,
            data.len() as u64,
            DEFAULT_CHUNK_SIZE,
            |p| reports.push(p),
        )
        .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
        // 100_000 bytes in 32 KiB chunks
        assert_eq!(reports.len(), 4);
        assert!(reports.windows(2).all(|w| w[0].transferred < w[1].transferred));
        assert_eq!(
            reports.last().copied(),
            Some(TransferProgress {
                transferred: 100_000,
                total: 100_000
            })
        );
    }

    #[test]
    fn test_empty_copy_reports_nothing() {
        let mut reports = 0;
        let copied = copy_with_progress(&mut Cursor::new(Vec::new()), &mut Vec::new(), 0, 1024, |_| reports += 1)
            .unwrap();
        assert_eq!(copied, 0);
        assert_eq!(reports, 0);
    }

    #[test]
    fn test_failure_reports_transferred_bytes() {
        let data = vec![7u8; 10_000];
        let mut writer = FailingWriter {
            written: Vec::new(),
            limit: 4096,
        };

        let (transferred, err) =
            copy_with_progress(&mut Cursor::new(&data), &mut writer, 10_000, 1024, |_| {}).unwrap_err();
        assert_eq!(transferred, 4096);
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_failure_mid_chunk_counts_accepted_bytes() {
        let data = vec![7u8; 10_000];
        let mut writer = FailingWriter {
            written: Vec::new(),
            limit: 1500,
        };

        let (transferred, _) =
            copy_with_progress(&mut Cursor::new(&data), &mut writer, 10_000, 1024, |_| {}).unwrap_err();
        assert_eq!(transferred, 1500);
        assert_eq!(writer.written.len(), 1500);
    }

    #[test]
    fn test_validate_remote_path() {
        assert_eq!(validate_remote_path("/var/log/syslog").unwrap(), "/var/log/syslog");
        assert_eq!(validate_remote_path("tmp/upload.bin").unwrap(), "/tmp/upload.bin");
        assert_eq!(validate_remote_path("/srv/..data/x").unwrap(), "/srv/..data/x");
        assert!(validate_remote_path("/srv/../etc/shadow").is_err());
        assert!(validate_remote_path("..").is_err());
        assert!(validate_remote_path("  ").is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        for bad in ["", "rwx", "788", "12345", "-1"] {
            assert_eq!(parse_mode(bad).unwrap_err().code(), "RESOURCE_ERROR");
        }
    }

    #[test]
    fn test_format_permissions() {
        assert_eq!(format_permissions(0o755, true, false), "drwxr-xr-x");
        assert_eq!(format_permissions(0o100644, false, false), "-rw-r--r--");
        assert_eq!(format_permissions(0o777, false, true), "lrwxrwxrwx");
    }
}
