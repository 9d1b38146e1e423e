use std::{
    ffi::CString,
    fs::OpenOptions,
    io::{self, Write},
    mem::MaybeUninit,
    os::{
        fd::AsRawFd,
        raw::{c_int, c_void},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
    ptr::{self, NonNull},
};

use libc::{mmap, munmap, off_t, size_t};

use crate::{
    config::MmapConfig,
    error::{MemoryError, Result},
    utils::align,
};

/// Name under which the mapped path reports failures.
pub(crate) const MMAP_BACKEND: &str = "mmap";

/// A buffer backed by a shared, read/write mapping of a file on disk.
///
/// ```text
///   <directory>/armaMM.XXXXXX                 address space
/// +---------------------------+          +---------------------------+
/// | 0000 0000 0000 ... 0000   |  <====>  | ptr .. ptr + len          |
/// +---------------------------+          +---------------------------+
///       zero-filled in bursts              MAP_SHARED, PROT_READ|WRITE
/// ```
///
/// Both file descriptors used to build the mapping are closed before this is
/// returned; the mapping stays valid until [`unmap`] is called on it.
pub(crate) struct MappedFile {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub path: PathBuf,
}

/// Computer's page size. Bursts are rounded to it so every write covers
/// whole pages.
fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Bytes an unprivileged writer can still put on the filesystem holding `dir`.
fn available_bytes(dir: &Path) -> io::Result<u64> {
    let c_dir = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    if unsafe { libc::statvfs(c_dir.as_ptr(), stat.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };

    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

/// Creates a uniquely named file in `config.directory`, zero-fills it until it
/// covers `len` bytes and maps it into the address space.
///
/// The file is left on disk afterwards; removing it is up to
/// [`remove_backing_file`]. The mapping must eventually be released with
/// [`unmap`] using the same `len`.
pub(crate) fn map_zeroed(len: usize, config: &MmapConfig) -> Result<MappedFile> {
    debug_assert!(len > 0);

    config.validate().map_err(|msg| {
        MemoryError::backing_file(
            config.directory(),
            io::Error::new(io::ErrorKind::InvalidInput, msg),
        )
    })?;

    // Requests larger than the free space fail before any zero is written.
    let available = available_bytes(config.directory())
        .map_err(|e| MemoryError::backing_file(config.directory(), e))?;
    if len as u64 > available {
        return Err(MemoryError::backing_file(
            config.directory(),
            io::Error::new(
                io::ErrorKind::StorageFull,
                format!("{len} bytes requested, {available} available"),
            ),
        ));
    }

    log::info!(
        "mapping {len} bytes onto a backing file in {}",
        config.directory().display()
    );

    // The zero-filling stream. Its name is random, which is what makes
    // concurrent acquisitions safe.
    let mut zero_fill = tempfile::Builder::new()
        .prefix(&config.file_prefix)
        .tempfile_in(config.directory())
        .map_err(|e| MemoryError::backing_file(config.directory(), e))?;

    let burst_len = align(config.burst_bytes.min(len), page_size());
    let burst = vec![0u8; burst_len];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(burst.len());
        zero_fill
            .write_all(&burst[..n])
            .map_err(|e| MemoryError::backing_file(zero_fill.path(), e))?;
        remaining -= n;
    }
    zero_fill
        .flush()
        .map_err(|e| MemoryError::backing_file(zero_fill.path(), e))?;

    // A second descriptor, opened read/write, is the one that gets mapped.
    let mapped = OpenOptions::new()
        .read(true)
        .write(true)
        .open(zero_fill.path())
        .map_err(|e| MemoryError::backing_file(zero_fill.path(), e))?;

    const ADDR: *mut c_void = ptr::null_mut::<c_void>();
    // Read-Write memory, visible through the file.
    const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
    const FLAGS: c_int = libc::MAP_SHARED;
    const OFFSET: off_t = 0;

    let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, mapped.as_raw_fd(), OFFSET) };

    if addr == libc::MAP_FAILED {
        return Err(MemoryError::OutOfMemory {
            bytes: len,
            backend: MMAP_BACKEND,
            source: Some(io::Error::last_os_error()),
        });
    }
    let ptr = NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| MemoryError::out_of_memory(len, MMAP_BACKEND))?;

    // Keep the file on disk; closing both descriptors leaves the mapping intact.
    let path = match zero_fill.keep() {
        Ok((_file, path)) => path,
        Err(e) => {
            let path = e.file.path().to_path_buf();
            if unsafe { munmap(ptr.as_ptr().cast(), len as size_t) } == -1 {
                log::warn!(
                    "unable to unmap {len} bytes at {ptr:?}: {}",
                    io::Error::last_os_error()
                );
            }
            return Err(MemoryError::backing_file(path, e.error));
        }
    };
    drop(mapped);

    log::debug!("mapped {len} bytes at {ptr:?} from {}", path.display());

    Ok(MappedFile { ptr, len, path })
}

/// Returns the mapping of `len` bytes starting from `addr` back to the kernel.
///
/// **SAFETY**: `addr` must be the start of a mapping created by [`map_zeroed`]
/// that is at most `len` bytes long and has not been unmapped yet.
pub(crate) unsafe fn unmap(addr: NonNull<u8>, len: usize) -> Result<()> {
    let status = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };

    if status == -1 {
        return Err(MemoryError::UnmapFailed {
            len,
            source: io::Error::last_os_error(),
        });
    }

    log::debug!("unmapped {len} bytes at {addr:?}");
    Ok(())
}

/// Deletes the backing file of a released mapping. Failure is only reported
/// through the log: the memory itself is already gone.
pub(crate) fn remove_backing_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("unable to remove backing file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> MmapConfig {
        MmapConfig::new(dir).with_burst_bytes(4096)
    }

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let dir = tempfile::tempdir().unwrap();
        let len = 3 * 4096 + 17;
        let mapping = map_zeroed(len, &config_in(dir.path())).unwrap();

        assert!(mapping.path.starts_with(dir.path()));
        assert!(
            mapping
                .path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("armaMM.")
        );
        assert!(std::fs::metadata(&mapping.path).unwrap().len() >= len as u64);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 7;
            bytes[len - 1] = 9;
            assert_eq!(bytes[len - 1], 9);

            unmap(mapping.ptr, len).unwrap();
        }
    }

    #[test]
    fn backing_file_survives_unmap() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = map_zeroed(100, &config_in(dir.path())).unwrap();

        unsafe { unmap(mapping.ptr, mapping.len).unwrap() };
        assert!(mapping.path.exists());

        remove_backing_file(&mapping.path);
        assert!(!mapping.path.exists());
    }

    #[test]
    fn writes_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = map_zeroed(8, &config_in(dir.path())).unwrap();

        unsafe {
            mapping.ptr.as_ptr().write_bytes(0x5A, 8);
            unmap(mapping.ptr, mapping.len).unwrap();
        }

        let contents = std::fs::read(&mapping.path).unwrap();
        assert_eq!(&contents[..8], &[0x5A; 8]);
    }

    #[test]
    fn zero_burst_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = MmapConfig::new(dir.path()).with_burst_bytes(0);

        let err = map_zeroed(64, &config).err().unwrap();
        assert!(matches!(err, MemoryError::BackingFile { .. }));
    }

    #[test]
    fn request_beyond_free_space_is_refused() {
        let dir = tempfile::tempdir().unwrap();

        let err = map_zeroed(usize::MAX / 2, &config_in(dir.path())).err().unwrap();
        match err {
            MemoryError::BackingFile { path, source } => {
                assert_eq!(path, dir.path());
                assert_eq!(source.kind(), io::ErrorKind::StorageFull);
            }
            other => panic!("expected BackingFile, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn free_space_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_bytes(dir.path()).unwrap() > 0);
        assert!(available_bytes(&dir.path().join("does-not-exist")).is_err());
    }

    #[test]
    fn missing_directory_is_a_backing_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir.path().join("does-not-exist"));

        let err = map_zeroed(64, &config).err().unwrap();
        assert!(matches!(err, MemoryError::BackingFile { .. }));
    }
}
