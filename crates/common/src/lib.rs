mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Where the agent binary lands inside the container. The agent unlinks this
/// path on exit.
pub const AGENT_PATH: &str = "/apf-agent";

/// Debug log destination for both binaries. The agent cannot use stdout (the
/// multiplexed pipe lives there), so `-d` sends everything here instead.
pub const DEBUG_LOG_PATH: &str = "/tmp/autoportforward.log";
