use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{PollSemaphore, PollSender};

use crate::frame::{Frame, MAX_DATA_LEN, WINDOW_UPDATE_THRESHOLD};
use crate::session::{Shared, StreamEvent};

/// One logical stream over the shared pipe.
///
/// Bytes are FIFO within the stream and flow-controlled against the peer's
/// receive window, so a stalled reader on one stream never backs up into the
/// others. Credit is counted in data frames: one window permit covers one
/// `Data` frame of up to `MAX_DATA_LEN` bytes. `shutdown` half-closes the
/// write side (ordered behind any queued data); dropping the stream closes
/// it outright.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,

    // Read side.
    pending: Vec<u8>,
    pending_pos: usize,
    drained: usize,
    read_eof: bool,
    read_reset: bool,

    // Write side.
    frames: PollSender<Frame>,
    send_window: PollSemaphore,
    reserved: Option<OwnedSemaphorePermit>,
    write_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Shared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        send_window: Arc<Semaphore>,
    ) -> Self {
        let frames = PollSender::new(shared.data_tx.clone());
        Self {
            id,
            shared,
            events,
            pending: Vec::new(),
            pending_pos: 0,
            drained: 0,
            read_eof: false,
            read_reset: false,
            frames,
            send_window: PollSemaphore::new(send_window),
            reserved: None,
            write_closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Grant the peer credit for a data frame fully handed to the reader.
    /// Updates are batched to half a window to keep frame overhead down.
    fn note_frame_drained(&mut self) {
        self.drained += 1;
        if self.drained >= WINDOW_UPDATE_THRESHOLD {
            let _ = self.shared.control_tx.send(Frame::WindowUpdate {
                stream_id: self.id,
                delta: self.drained as u32,
            });
            self.drained = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending_pos < this.pending.len() {
                let available = &this.pending[this.pending_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pending_pos += n;
                if this.pending_pos == this.pending.len() {
                    this.note_frame_drained();
                }
                return Poll::Ready(Ok(()));
            }
            if this.read_reset {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(payload))) => {
                    this.pending = payload;
                    this.pending_pos = 0;
                }
                Poll::Ready(Some(StreamEvent::Eof)) | Poll::Ready(None) => this.read_eof = true,
                Poll::Ready(Some(StreamEvent::Reset)) => this.read_reset = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // First claim window credit for one frame, then a slot on the shared
        // write queue.
        if this.reserved.is_none() {
            match this.send_window.poll_acquire(cx) {
                Poll::Ready(Some(permit)) => this.reserved = Some(permit),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.frames.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let permit = this.reserved.take().unwrap();
                let len = buf.len().min(MAX_DATA_LEN);
                // Credit is spent for good; the peer gives it back with a
                // window update once its reader drains the frame.
                permit.forget();
                let frame = Frame::Data {
                    stream_id: this.id,
                    payload: buf[..len].to_vec(),
                };
                if this.frames.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(len))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed to the pipe as the write loop drains them.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        // Close travels on the data queue so it cannot overtake queued data.
        match this.frames.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.frames.send_item(Frame::Close {
                    stream_id: this.id,
                });
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Session is gone; the peer sees the pipe teardown instead.
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.release_stream(self.id);
        if !self.write_closed {
            let _ = self.shared.control_tx.send(Frame::Close {
                stream_id: self.id,
            });
        }
    }
}
