//! File attachment transfer over data streams.
//!
//! Transfers are pull-based: the receiver opens a data stream, names its
//! port in a `FileRequest` along with the local file length, and the
//! sender streams the file from that offset until EOF. Appending to the
//! existing file means a partial transfer resumes wherever it stopped,
//! on whichever session answers first.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use super::peer::Peer;
use super::session::Session;
use crate::error::{Error, Result};
use crate::protocol::mux::DATA_STREAM_BUFFER;
use crate::protocol::packet::MeshPacket;

/// How long the receiver waits for the first byte from a candidate
/// session before falling over to the next one.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pull a file attachment into `file_path`, resuming at its current
/// length. Each of the peer's sessions is tried in turn until one
/// delivers; returns the final file length.
pub async fn receive_file_attachment(
    peer: &Arc<Peer>,
    request_number: u32,
    file_path: &Path,
) -> Result<u64> {
    let sessions = peer.sessions();
    if sessions.is_empty() {
        return Err(Error::NoSession);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .await
        .map_err(|e| Error::Storage(format!("failed to open {file_path:?}: {e}")))?;

    let mut last_error = Error::NoSession;
    for session in sessions {
        let offset = file
            .metadata()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
            .len();

        match pull_over_session(&session, request_number, offset, &mut file).await {
            Ok(total) => {
                info!(message_number = request_number, bytes = total, "file transfer complete");
                return Ok(total);
            }
            Err(e) => {
                debug!(
                    message_number = request_number,
                    error = %e,
                    "session transfer attempt failed, trying next"
                );
                last_error = e;
            }
        }
    }

    Err(last_error)
}

async fn pull_over_session(
    session: &Arc<Session>,
    request_number: u32,
    offset: u64,
    file: &mut File,
) -> Result<u64> {
    let mut stream = session.open_data_stream(None)?;
    stream.set_read_timeout(PROBE_TIMEOUT);

    session
        .send_packet(&MeshPacket::FileRequest {
            message_number: request_number,
            file_offset: offset,
            data_port: stream.port(),
        })
        .await?;

    // One-byte probe: an immediate EOF means this session cannot serve
    // the file and the next one should be tried.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).await?;
    if n == 0 {
        let _ = stream.close().await;
        return Err(Error::NotFound("peer did not serve the file".into()));
    }
    file.write_all(&probe[..n])
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
    let mut written = offset + n as u64;

    let mut buf = vec![0u8; DATA_STREAM_BUFFER];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        written += n as u64;
    }

    file.flush().await.map_err(|e| Error::Storage(e.to_string()))?;
    let _ = stream.close().await;
    Ok(written)
}

/// Serve a peer's `FileRequest`: stream the local file from `offset` on
/// the requested port, then close with a zero-length frame.
pub async fn serve_file_request(
    session: &Arc<Session>,
    local_path: &Path,
    offset: u64,
    port: u16,
) -> Result<u64> {
    let mut stream = session.open_data_stream(Some(port))?;

    let mut file = match File::open(local_path).await {
        Ok(file) => file,
        Err(e) => {
            // Closing right away is the "cannot serve" signal the
            // requester's probe read understands.
            let _ = stream.close().await;
            return Err(Error::Storage(format!("failed to open {local_path:?}: {e}")));
        }
    };
    if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
        let _ = stream.close().await;
        return Err(Error::Storage(e.to_string()));
    }

    let mut buf = vec![0u8; DATA_STREAM_BUFFER];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        if n == 0 {
            break;
        }
        if let Err(e) = stream.write(&buf[..n]).await {
            warn!(port, error = %e, "file serve aborted");
            return Err(e);
        }
        sent += n as u64;
    }

    stream.close().await?;
    debug!(port, offset, bytes = sent, "file served");
    Ok(sent)
}
