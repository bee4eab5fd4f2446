//! Stream multiplexer: many independent, ordered, flow-controlled logical
//! streams over one full-duplex byte pipe.
//!
//! The two ends take opposite [`Mode`]s so stream-id parity never collides.
//! The server end is the one that spawned the peer process (and reaps it on
//! shutdown); the client end runs over its own stdin/stdout. Liveness is not
//! this layer's job — the control protocol above it pings.

mod codec;
mod frame;
mod session;
mod stream;

pub use session::{Mode, MuxControl, MuxOpener, MuxSession};
pub use stream::MuxStream;
