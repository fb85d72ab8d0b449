//! Secure erase of a byte range on a device.
//!
//! One overwrite pass with a deterministic pattern followed by a full
//! read-back. A device that accepts fewer bytes than it was given (or comes
//! back with anything but the pattern) fails verification; there is no
//! retry. Between the two passes the target is synced and its cached copy
//! of the range dropped, so the read-back sees what the device stored.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DiskError, DiskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "byte")]
pub enum WipePattern {
    Zero,
    Fill(u8),
    /// `offset % 251`, so misplaced or dropped chunks do not verify.
    Counter,
}

impl WipePattern {
    pub fn byte_at(self, offset: u64) -> u8 {
        match self {
            WipePattern::Zero => 0,
            WipePattern::Fill(byte) => byte,
            WipePattern::Counter => (offset % 251) as u8,
        }
    }

    fn fill(self, buf: &mut [u8], offset: u64) {
        match self {
            WipePattern::Zero => buf.fill(0),
            WipePattern::Fill(byte) => buf.fill(byte),
            WipePattern::Counter => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.byte_at(offset + i as u64);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipePolicy {
    pub pattern: WipePattern,
    pub chunk_size: usize,
}

impl Default for WipePolicy {
    fn default() -> Self {
        Self {
            pattern: WipePattern::Zero,
            chunk_size: 1024 * 1024,
        }
    }
}

impl WipePolicy {
    pub fn new(pattern: WipePattern) -> Self {
        Self {
            pattern,
            ..Default::default()
        }
    }
}

/// Something [`wipe_range`] can overwrite and read back.
pub trait WipeTarget: Read + Write + Seek {
    /// Push everything written so far down to the device.
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Forget any cached copy of `[start, start + len)`.
    fn drop_cache(&mut self, _start: u64, _len: u64) -> DiskResult<()> {
        Ok(())
    }
}

impl WipeTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn drop_cache(&mut self, start: u64, len: u64) -> DiskResult<()> {
        Ok(vdisk_hal::drop_cached_range(self, start, len)?)
    }
}

impl WipeTarget for Cursor<Vec<u8>> {}

/// Overwrite `[start, start + len)` of `device` and verify it.
pub fn wipe_range<D: WipeTarget>(
    device: &mut D,
    start: u64,
    len: u64,
    policy: &WipePolicy,
) -> DiskResult<()> {
    if policy.chunk_size == 0 {
        return Err(DiskError::Config("wipe chunk size must be non-zero".into()));
    }
    info!(start, len, pattern = ?policy.pattern, "wiping range");

    let mut buf = vec![0u8; policy.chunk_size];

    device.seek(SeekFrom::Start(start))?;
    let mut offset = start;
    let end = start + len;
    while offset < end {
        let chunk = (end - offset).min(buf.len() as u64) as usize;
        policy.pattern.fill(&mut buf[..chunk], offset);
        device.write_all(&buf[..chunk])?;
        offset += chunk as u64;
    }
    device.sync()?;
    device.drop_cache(start, len)?;
    debug!(start, len, "overwrite pass complete, verifying");

    verify_range(device, start, len, policy, &mut buf)
}

fn verify_range<D: Read + Seek>(
    device: &mut D,
    start: u64,
    len: u64,
    policy: &WipePolicy,
    buf: &mut [u8],
) -> DiskResult<()> {
    device.seek(SeekFrom::Start(start))?;
    let mut offset = start;
    let end = start + len;
    while offset < end {
        let want = (end - offset).min(buf.len() as u64) as usize;
        let got = read_up_to(device, &mut buf[..want])?;

        if let Some(i) = buf[..got]
            .iter()
            .enumerate()
            .position(|(i, b)| *b != policy.pattern.byte_at(offset + i as u64))
        {
            let at = offset + i as u64;
            return Err(DiskError::WipeVerificationFailed {
                offset: at,
                expected: policy.pattern.byte_at(at),
                found: format!("{:#04x}", buf[i]),
            });
        }
        if got < want {
            let at = offset + got as u64;
            return Err(DiskError::WipeVerificationFailed {
                offset: at,
                expected: policy.pattern.byte_at(at),
                found: "end of device".to_string(),
            });
        }
        offset += got as u64;
    }
    Ok(())
}

/// Read until `buf` is full or the device reports end of data.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> DiskResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts every write but silently drops bytes past `limit`.
    struct TruncatingDevice {
        inner: Cursor<Vec<u8>>,
        limit: u64,
    }

    impl Read for TruncatingDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for TruncatingDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let pos = self.inner.position();
            let keep = self.limit.saturating_sub(pos).min(buf.len() as u64) as usize;
            self.inner.write_all(&buf[..keep])?;
            self.inner.set_position(pos + buf.len() as u64);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for TruncatingDevice {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl WipeTarget for TruncatingDevice {}

    /// Write-back cache in front of a store that keeps only `limit` bytes.
    /// Reads are served from the cache until it is dropped.
    struct WriteBackDevice {
        store: Vec<u8>,
        cache: Option<Vec<u8>>,
        pos: u64,
        limit: usize,
        syncs: usize,
    }

    impl WriteBackDevice {
        fn new(store: Vec<u8>, limit: usize) -> Self {
            Self {
                store,
                cache: None,
                pos: 0,
                limit,
                syncs: 0,
            }
        }

        fn view(&self) -> &[u8] {
            self.cache.as_deref().unwrap_or(&self.store)
        }
    }

    impl Read for WriteBackDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.pos as usize;
            let view = self.view();
            if pos >= view.len() {
                return Ok(0);
            }
            let n = buf.len().min(view.len() - pos);
            buf[..n].copy_from_slice(&view[pos..pos + n]);
            self.pos += n as u64;
            Ok(n)
        }
    }

    impl Write for WriteBackDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let pos = self.pos as usize;
            let store = self.store.clone();
            let cache = self.cache.get_or_insert(store);
            if cache.len() < pos + buf.len() {
                cache.resize(pos + buf.len(), 0);
            }
            cache[pos..pos + buf.len()].copy_from_slice(buf);
            self.pos += buf.len() as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for WriteBackDevice {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.pos = match pos {
                SeekFrom::Start(n) => n,
                SeekFrom::Current(d) => (self.pos as i64 + d) as u64,
                SeekFrom::End(d) => (self.view().len() as i64 + d) as u64,
            };
            Ok(self.pos)
        }
    }

    impl WipeTarget for WriteBackDevice {
        fn sync(&mut self) -> io::Result<()> {
            self.syncs += 1;
            if let Some(cache) = &self.cache {
                let keep = cache.len().min(self.limit);
                self.store = cache[..keep].to_vec();
            }
            Ok(())
        }

        fn drop_cache(&mut self, _start: u64, _len: u64) -> DiskResult<()> {
            self.cache = None;
            Ok(())
        }
    }

    #[test]
    fn test_wipe_only_touches_range() {
        let mut device = Cursor::new(vec![0xAAu8; 8192]);
        let policy = WipePolicy {
            pattern: WipePattern::Counter,
            chunk_size: 1000,
        };
        wipe_range(&mut device, 1024, 4096, &policy).unwrap();

        let data = device.into_inner();
        assert!(data[..1024].iter().all(|b| *b == 0xAA));
        assert!(data[5120..].iter().all(|b| *b == 0xAA));
        for (i, b) in data[1024..5120].iter().enumerate() {
            assert_eq!(*b, ((1024 + i as u64) % 251) as u8);
        }
    }

    #[test]
    fn test_silent_truncation_fails_verification() {
        let mut device = TruncatingDevice {
            inner: Cursor::new(vec![0xAAu8; 1024]),
            limit: 2048,
        };
        let err = wipe_range(&mut device, 0, 4096, &WipePolicy::new(WipePattern::Zero)).unwrap_err();
        match err {
            DiskError::WipeVerificationFailed { offset, found, .. } => {
                assert_eq!(offset, 2048);
                assert_eq!(found, "end of device");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_mismatch_reports_offset() {
        let mut data = vec![0u8; 512];
        let policy = WipePolicy::new(WipePattern::Fill(0x5A));
        let mut buf = vec![0u8; 128];
        data[..300].fill(0x5A);
        let err = verify_range(&mut Cursor::new(data), 0, 512, &policy, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            DiskError::WipeVerificationFailed { offset: 300, expected: 0x5A, .. }
        ));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let policy = WipePolicy {
            pattern: WipePattern::Zero,
            chunk_size: 0,
        };
        let mut device = Cursor::new(vec![0u8; 16]);
        assert!(matches!(
            wipe_range(&mut device, 0, 16, &policy),
            Err(DiskError::Config(_))
        ));
    }

    #[test]
    fn test_verification_reads_past_write_back_cache() {
        let mut device = WriteBackDevice::new(vec![0xAAu8; 4096], 2048);
        let err = wipe_range(&mut device, 0, 4096, &WipePolicy::new(WipePattern::Zero)).unwrap_err();
        assert_eq!(device.syncs, 1);
        assert!(matches!(
            err,
            DiskError::WipeVerificationFailed { offset: 2048, .. }
        ));
    }

    #[test]
    fn test_write_back_device_that_keeps_everything_verifies() {
        let mut device = WriteBackDevice::new(vec![0xAAu8; 4096], 4096);
        wipe_range(&mut device, 0, 4096, &WipePolicy::new(WipePattern::Counter)).unwrap();
        assert!(device.cache.is_none());
        assert_eq!(device.store[300], (300 % 251) as u8);
    }

    #[test]
    fn test_wipe_file_through_page_cache() {
        let mut file = tempfile::tempfile().expect("Failed to create temp file");
        file.set_len(64 * 1024).unwrap();
        let policy = WipePolicy {
            pattern: WipePattern::Fill(0x5A),
            chunk_size: 4096,
        };
        wipe_range(&mut file, 4096, 16 * 1024, &policy).unwrap();

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut data).unwrap();
        assert!(data[..4096].iter().all(|b| *b == 0));
        assert!(data[4096..20 * 1024].iter().all(|b| *b == 0x5A));
        assert!(data[20 * 1024..].iter().all(|b| *b == 0));
    }
}
