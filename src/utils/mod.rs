// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod error;

use std::backtrace::Backtrace;
use std::fs;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::panic;
use std::path::Path;
use std::process;
use std::ptr::NonNull;
use std::sync::Mutex;

use nix::sys::mman;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use tracing::Level;
use tracing_subscriber::prelude::*;

use crate::prelude::*;

pub const HUGEPAGE_SIZE: u64 = 2 << 20;

/// Stderr gets `stderr_level` and above; when a log file is configured it
/// gets its own (usually chattier) level, without ANSI escapes.
pub fn init_tracing(
    stderr_level: Level,
    log_file: Option<&Path>,
    file_level: Level,
) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr.with_max_level(stderr_level))
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(loc!(), || format!("creating log file {path:?}"))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file).with_max_level(file_level))
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        },
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        },
    }
    Ok(())
}

/// A panicking worker (evictor, prefetch slave, connection dispatcher)
/// leaves the runtime unusable, so take the whole process down instead of
/// limping on without it.
pub fn abort_process_on_panic() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        error!("thread panicked: {info}\n{}", Backtrace::capture());
        default_hook(info);
        process::exit(1);
    }));
}

/// Binds the out-of-band control socket, replacing a stale one from a
/// previous run. Control commands can mutate runtime state; the socket
/// stays owner-only.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).location(loc!())?;
    }
    match fs::remove_file(path) {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => {
            return Err(e).with_context(loc!(), || format!("unlinking stale socket {path:?}"));
        },
    }
    let listener = UnixListener::bind(path)
        .with_context(loc!(), || format!("binding control socket {path:?}"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).location(loc!())?;
    Ok(listener)
}

/// An anonymous memory reservation rounded up to the hugepage size, backed by
/// hugepages when the kernel will grant them and by plain pages otherwise.
#[derive(Debug)]
pub struct MemoryReservation {
    ptr: NonNull<std::ffi::c_void>,
    len: usize,
    hugepages: bool,
}

// SAFETY: the reservation is an owned anonymous mapping; nothing aliases it.
unsafe impl Send for MemoryReservation {}

impl MemoryReservation {
    pub fn reserve(size: u64) -> Result<Self> {
        let len = ((size.max(1) - 1) / HUGEPAGE_SIZE + 1) * HUGEPAGE_SIZE;
        let len = usize::try_from(len).location(loc!())?;
        let nz_len = NonZeroUsize::new(len).context(loc!(), "empty reservation")?;

        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        // SAFETY: anonymous mapping, no fd, no fixed address.
        let hugetlb = unsafe {
            mman::mmap_anonymous(
                None,
                nz_len,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_HUGETLB,
            )
        };
        match hugetlb {
            Ok(ptr) => Ok(Self {
                ptr: ptr.cast(),
                len,
                hugepages: true,
            }),
            Err(errno) => {
                debug!("hugepage reservation of {len} bytes failed ({errno}), using plain pages");
                // SAFETY: as above.
                let ptr = unsafe {
                    mman::mmap_anonymous(None, nz_len, prot, MapFlags::MAP_PRIVATE)
                }
                .location(loc!())?;
                Ok(Self {
                    ptr: ptr.cast(),
                    len,
                    hugepages: false,
                })
            },
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hugepage_backed(&self) -> bool {
        self.hugepages
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(errno) = unsafe { mman::munmap(self.ptr, self.len) } {
            warn!("munmap of memory reservation failed: {errno}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_rounds_to_hugepage() {
        let r = MemoryReservation::reserve(1).unwrap();
        assert_eq!(r.len() as u64, HUGEPAGE_SIZE);

        let r = MemoryReservation::reserve(HUGEPAGE_SIZE + 1).unwrap();
        assert_eq!(r.len() as u64, 2 * HUGEPAGE_SIZE);
    }

    #[test]
    fn test_control_socket_is_owner_only() {
        let dir = std::env::temp_dir().join(format!("farmem-utils-{}", std::process::id()));
        let path = dir.join("nested").join("ctrl.sock");
        let _listener = bind_control_socket(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        // Rebinding over the stale socket works.
        let _listener = bind_control_socket(&path).unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }
}
