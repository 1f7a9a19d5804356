//! CAN Channel Abstraction (C1)
//!
//! A thin, transport-agnostic wrapper around a `socketcan` raw CAN socket.
//! Exposes exactly the three operations the protocol layer needs: send,
//! receive-with-timeout, and close. Send failures are reported to the
//! caller, who is responsible for logging and counting them — the channel
//! itself never terminates on a send error.

use embedded_can::{Frame as EmbeddedFrame, StandardId};
use socketcan::{CanFrame as SocketCanFrame, CanSocket, Frame as SocketFrame, Socket};
use std::io::ErrorKind;
use std::time::Duration;

use crate::error::{EcuError, Result};

/// A single CAN frame: an 11-bit arbitration id plus up to 8 data bytes.
///
/// Extended (29-bit) ids are out of scope for this ECU (§6); `extended` is
/// carried for completeness but always `false` on frames this crate builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u16, data: &[u8]) -> Self {
        Self {
            id,
            extended: false,
            data: data.to_vec(),
        }
    }
}

/// Non-blocking-with-timeout CAN channel bound to a named interface (e.g. "vcan0").
pub struct CanChannel {
    socket: CanSocket,
    interface: String,
}

impl CanChannel {
    /// Open the channel by interface name. Propagates a startup error on
    /// failure — this is the one place a channel failure is fatal (§4.1, §7).
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|source| EcuError::ChannelOpen {
            interface: interface.to_string(),
            source,
        })?;

        socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(EcuError::ChannelConfig)?;

        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Transmit a frame. Errors are returned, never panicked on; the caller
    /// logs and increments the error counter (§4.1, §7).
    pub fn send(&self, frame: &CanFrame) -> Result<()> {
        let id = StandardId::new(frame.id).ok_or_else(|| {
            EcuError::Send(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("arbitration id 0x{:X} exceeds 11 bits", frame.id),
            ))
        })?;
        let can_frame = SocketCanFrame::new(id, &frame.data)
            .ok_or_else(|| EcuError::Send(std::io::Error::new(ErrorKind::InvalidInput, "frame data too long")))?;

        self.socket.write_frame(&can_frame).map_err(EcuError::Send)
    }

    /// Receive one frame, waiting up to the configured read timeout.
    /// Returns `Ok(None)` on a plain timeout (the normal case in the poll
    /// loop, not an error); other I/O errors are propagated.
    pub fn recv(&self) -> Result<Option<CanFrame>> {
        match self.socket.read_frame() {
            Ok(frame) => Ok(Some(CanFrame {
                id: (frame.raw_id() & 0x7FF) as u16,
                extended: frame.is_extended(),
                data: frame.data().to_vec(),
            })),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(EcuError::Recv(e)),
        }
    }

    /// Close is implicit on drop for a socketcan socket; kept as an explicit
    /// operation to match the C1 contract (§4.1) and give the supervisor a
    /// clear shutdown step to call.
    pub fn close(self) {
        drop(self);
    }
}
