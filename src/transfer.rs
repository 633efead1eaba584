//! Chunked file copy through guest file handles.
//!
//! Uploads run `guest-file-open` (wb+) → `guest-file-write`* →
//! `guest-file-close`; downloads run `guest-file-open` (r) →
//! `guest-file-read` until `eof` → `guest-file-close`. Chunks go strictly
//! one at a time.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::client::{AgentChannel, AgentClient};
use crate::decode::decode_payload;
use crate::error::QgaError;
use crate::protocol::{FileMode, GuestFileClose, GuestFileOpen, GuestFileRead, GuestFileWrite};

/// Transfer buffer size, matching the agent-side default read size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest `count` the agent accepts for a single read.
pub const MAX_CHUNK_SIZE: usize = 48 * 1024 * 1024;

/// An open guest file handle. Closed exactly once: explicitly through
/// [`GuestFile::close`] or, on early return, when dropped.
struct GuestFile<'a, C: AgentChannel> {
    client: &'a AgentClient<C>,
    handle: i64,
    closed: bool,
}

impl<'a, C: AgentChannel> GuestFile<'a, C> {
    fn open(client: &'a AgentClient<C>, path: &str, mode: FileMode) -> Result<Self, QgaError> {
        let handle = client.call(&GuestFileOpen {
            path: path.to_string(),
            mode,
        })?;
        tracing::debug!(handle, path, ?mode, "guest file opened");
        Ok(Self {
            client,
            handle,
            closed: false,
        })
    }

    fn close(mut self) -> Result<(), QgaError> {
        self.closed = true;
        self.client.call(&GuestFileClose {
            handle: self.handle,
        })?;
        tracing::debug!(handle = self.handle, "guest file closed");
        Ok(())
    }
}

impl<C: AgentChannel> Drop for GuestFile<'_, C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.client.call(&GuestFileClose {
            handle: self.handle,
        }) {
            tracing::warn!(handle = self.handle, error = %e, "failed to close guest file");
        }
    }
}

/// Copy `local` into the guest at `remote`. Returns the bytes sent.
pub fn put<C: AgentChannel>(
    client: &AgentClient<C>,
    local: &Path,
    remote: &str,
    chunk_size: usize,
) -> Result<u64, QgaError> {
    tracing::debug!(src = %local.display(), dst = remote, "PUT");

    if !local.exists() {
        return Err(QgaError::LocalFileNotFound {
            path: local.to_path_buf(),
        });
    }
    let mut file = File::open(local).map_err(|e| QgaError::Io {
        context: format!("opening {}", local.display()),
        source: e,
    })?;

    let guest = GuestFile::open(client, remote, FileMode::WriteCreateTruncate)?;
    let sent = write_chunks(&guest, &mut file, chunk_size)
        .map_err(|e| transfer_failure(local.display().to_string(), remote.to_string(), e))?;
    guest.close()?;

    tracing::debug!(bytes = sent, dst = remote, "upload complete");
    Ok(sent)
}

/// Copy guest file `remote` to `local`, creating or truncating it. Returns
/// the bytes received.
pub fn get<C: AgentChannel>(
    client: &AgentClient<C>,
    remote: &str,
    local: &Path,
    chunk_size: usize,
) -> Result<u64, QgaError> {
    tracing::debug!(src = remote, dst = %local.display(), "FETCH");

    let guest = GuestFile::open(client, remote, FileMode::Read)?;
    let file = File::create(local).map_err(|e| QgaError::Io {
        context: format!("creating {}", local.display()),
        source: e,
    })?;

    let received = read_chunks(&guest, BufWriter::new(file), chunk_size)
        .map_err(|e| transfer_failure(remote.to_string(), local.display().to_string(), e))?;
    guest.close()?;

    tracing::debug!(bytes = received, src = remote, "download complete");
    Ok(received)
}

fn write_chunks<C: AgentChannel>(
    guest: &GuestFile<'_, C>,
    reader: &mut impl Read,
    chunk_size: usize,
) -> Result<u64, QgaError> {
    let mut buf = Vec::with_capacity(chunk_size);
    let mut total = 0u64;

    loop {
        buf.clear();
        let n = reader
            .by_ref()
            .take(chunk_size as u64)
            .read_to_end(&mut buf)
            .map_err(|e| QgaError::Io {
                context: "reading local file".into(),
                source: e,
            })?;
        if n == 0 {
            return Ok(total);
        }

        guest.client.call(&GuestFileWrite {
            handle: guest.handle,
            buf_b64: STANDARD.encode(&buf),
        })?;
        total += n as u64;
        tracing::trace!(handle = guest.handle, bytes = n, total, "chunk written");
    }
}

fn read_chunks<C: AgentChannel, W: Write>(
    guest: &GuestFile<'_, C>,
    mut out: W,
    chunk_size: usize,
) -> Result<u64, QgaError> {
    let request = GuestFileRead {
        handle: guest.handle,
        count: chunk_size,
    };
    let mut total = 0u64;

    loop {
        let chunk = guest.client.call(&request)?;
        let data = decode_payload("guest-file-read", chunk.buf_b64.as_deref())?;
        out.write_all(&data).map_err(|e| QgaError::Io {
            context: "writing local file".into(),
            source: e,
        })?;
        total += data.len() as u64;
        tracing::trace!(handle = guest.handle, bytes = data.len(), total, eof = chunk.eof, "chunk read");

        if chunk.eof {
            break;
        }
    }

    out.flush().map_err(|e| QgaError::Io {
        context: "flushing local file".into(),
        source: e,
    })?;
    Ok(total)
}

fn transfer_failure(src: String, dst: String, source: QgaError) -> QgaError {
    tracing::debug!(%src, %dst, error = %source, "transfer aborted");
    QgaError::TransferFailure {
        src,
        dst,
        source: Box::new(source),
    }
}
