//! Drains classification records out of the kernel ring buffer.

use std::sync::Arc;

use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, warn};

use crate::state::SourceTable;

/// Reads records as the kernel commits them and counts them in a
/// [`SourceTable`].
///
/// Wakeups come from the ring buffer's fd via `AsyncFd`, so an idle ring
/// costs nothing.
pub struct RecordReader {
    ring_buf: RingBuf<MapData>,
    table: Arc<SourceTable>,
}

impl RecordReader {
    pub fn new(ring_buf: RingBuf<MapData>, table: Arc<SourceTable>) -> Self {
        Self { ring_buf, table }
    }

    /// Runs until the ring buffer fd fails, then flags the table so the
    /// health endpoint stops reporting ok. Meant to be spawned.
    pub async fn run(self) {
        info!("reading classification records from ring buffer");
        let Self { ring_buf, table } = self;
        drain(ring_buf, &table).await;
        table.mark_reader_stopped();
    }
}

async fn drain(ring_buf: RingBuf<MapData>, table: &SourceTable) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to create AsyncFd for ring buffer: {e}");
            return;
        }
    };

    loop {
        let mut guard = match async_fd.readable_mut().await {
            Ok(guard) => guard,
            Err(e) => {
                error!("error waiting for ring buffer readability: {e}");
                return;
            }
        };

        let ring_buf = guard.get_inner_mut();
        while let Some(item) = ring_buf.next() {
            match table.ingest(&item) {
                Ok(record) => debug!(?record, "record"),
                Err(e) => warn!("skipping malformed ring buffer record: {e}"),
            }
        }

        guard.clear_ready();
    }
}
