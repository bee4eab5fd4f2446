use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use apf_common::DEBUG_LOG_PATH;

struct FileWriter(Arc<File>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// With `-d`, append tracing output to the shared debug log file. The
/// terminal stays reserved for the banner and the forwarding summary line.
pub fn init(debug: bool) {
    if !debug {
        return;
    }
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(DEBUG_LOG_PATH)
    {
        Ok(file) => Arc::new(file),
        Err(e) => {
            eprintln!("apf: cannot open {DEBUG_LOG_PATH}: {e}");
            return;
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || FileWriter(Arc::clone(&file)))
        .with_ansi(false)
        .init();
}
