/// Maximum encoded frame size accepted off the pipe: 1 MB.
pub(crate) const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Maximum payload carried by a single `Data` frame.
pub(crate) const MAX_DATA_LEN: usize = 16 * 1024;

/// Data frames a sender may have in flight per stream before the reader
/// grants more credit (16 x 16 KiB = 256 KiB of payload).
pub(crate) const WINDOW_FRAMES: usize = 16;

/// Drained frames are batched into a `WindowUpdate` once this many have been
/// handed to the reader.
pub(crate) const WINDOW_UPDATE_THRESHOLD: usize = WINDOW_FRAMES / 2;

/// A frame multiplexing many logical streams onto the shared pipe.
///
/// Wire format: `[4 bytes: payload length BE][rkyv-encoded Frame]`. Both ends
/// of the pipe are always the same build, so the encoding needs no version
/// negotiation.
#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq,
)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub(crate) enum Frame {
    /// Sender opened a new stream. Stream ids carry the opener's parity, so
    /// both sides can open without coordination.
    Open { stream_id: u32 },
    /// Ordered payload bytes on an open stream.
    Data { stream_id: u32, payload: Vec<u8> },
    /// The receiver drained `delta` data frames; the sender may send that
    /// many more.
    WindowUpdate { stream_id: u32, delta: u32 },
    /// Sender is done writing (half-close). Data queued before this frame is
    /// still delivered.
    Close { stream_id: u32 },
    /// Abortive close; pending data may be discarded.
    Reset { stream_id: u32 },
}

impl Frame {
    pub(crate) fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id }
            | Frame::Data { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Close { stream_id }
            | Frame::Reset { stream_id } => *stream_id,
        }
    }
}
