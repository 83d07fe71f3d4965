//! One TCP connection: serialized framed writes and a reassembling reader.

use std::net::SocketAddr;

use freepath_core::LinkConfig;
use freepath_core::error::LinkError;
use freepath_core::frame::Frame;
use freepath_core::wire;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::codec::{self, DecodeOutcome, FrameDecoder};

/// Enable TCP keep-alive and disable Nagle on a fresh stream.
pub(crate) fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Write side of a connection, shared by every sender to the peer.
#[derive(Debug)]
pub(crate) struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    shutdown: Notify,
    peer_addr: SocketAddr,
    mtu: usize,
}

impl Connection {
    pub(crate) fn new(writer: OwnedWriteHalf, peer_addr: SocketAddr, mtu: usize) -> Self {
        Self {
            writer: Mutex::new(writer),
            shutdown: Notify::new(),
            peer_addr,
            mtu,
        }
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write every fragment of `frame` without interleaving other frames.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        let envelopes = codec::encode_frame(frame, self.mtu)?;
        let mut writer = self.writer.lock().await;
        for envelope in &envelopes {
            writer.write_all(envelope).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Stop the reader and half-close the socket.
    pub(crate) async fn close(&self) {
        // Stores a permit if the reader is not currently waiting
        self.shutdown.notify_one();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!(addr = %self.peer_addr, error = %e, "socket shutdown failed");
        }
    }

    /// Resolves once [`Connection::close`] has been called.
    pub(crate) async fn closed(&self) {
        self.shutdown.notified().await;
    }
}

/// Read side of a connection.
#[derive(Debug)]
pub(crate) struct FrameReader {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
}

impl FrameReader {
    pub(crate) fn new(reader: OwnedReadHalf, config: &LinkConfig) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(config),
        }
    }

    /// Read envelopes until a complete frame is available.
    ///
    /// Malformed packets and frames are skipped; socket errors, a bad
    /// header or an unsupported wire version end the connection.
    pub(crate) async fn next_frame(&mut self) -> Result<Frame, LinkError> {
        loop {
            let mut header = [0u8; wire::HEADER_SIZE];
            self.reader.read_exact(&mut header).await?;
            let header = wire::decode_header(&header)?;

            let mut payload = vec![0u8; header.length];
            self.reader.read_exact(&mut payload).await?;

            match self.decoder.push(&header, &payload)? {
                DecodeOutcome::Frame(frame) => return Ok(frame),
                DecodeOutcome::Pending => {}
                DecodeOutcome::Dropped(e) => {
                    tracing::debug!(error = %e, "dropping malformed frame");
                }
            }
        }
    }
}
