use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use pacer_common::{AddressFamily, ClassificationRecord, DecodeError};

/// A sender as seen on one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Source {
    pub ifindex: u32,
    pub address: IpAddr,
}

impl From<&ClassificationRecord> for Source {
    fn from(record: &ClassificationRecord) -> Self {
        Self {
            ifindex: record.ifindex,
            address: record.source.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub packets: u64,
    /// Unix millis of the first record for this source.
    pub first_seen: i64,
    /// Unix millis of the most recent record for this source.
    pub last_seen: i64,
}

/// Per-source packet counts built from the records the XDP program emits.
pub struct SourceTable {
    pub sources: DashMap<Source, SourceStats>,
    pub ipv4_records: AtomicU64,
    pub ipv6_records: AtomicU64,
    pub malformed_records: AtomicU64,
    /// Cleared when the ring buffer reader stops for good.
    pub reader_alive: AtomicBool,
}

impl SourceTable {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            ipv4_records: AtomicU64::new(0),
            ipv6_records: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            reader_alive: AtomicBool::new(true),
        }
    }

    /// Decodes one ring buffer entry and counts it.
    pub fn ingest(&self, bytes: &[u8]) -> Result<ClassificationRecord, DecodeError> {
        match ClassificationRecord::from_wire(bytes) {
            Ok(record) => {
                self.update(&record, chrono::Utc::now().timestamp_millis());
                Ok(record)
            }
            Err(e) => {
                self.malformed_records.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn update(&self, record: &ClassificationRecord, now_ms: i64) {
        self.sources
            .entry(Source::from(record))
            .and_modify(|stats| {
                stats.packets += 1;
                stats.last_seen = now_ms;
            })
            .or_insert_with(|| SourceStats {
                packets: 1,
                first_seen: now_ms,
                last_seen: now_ms,
            });

        let counter = match record.source.family() {
            AddressFamily::Ipv4 => &self.ipv4_records,
            AddressFamily::Ipv6 => &self.ipv6_records,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_records(&self) -> u64 {
        self.ipv4_records.load(Ordering::Relaxed) + self.ipv6_records.load(Ordering::Relaxed)
    }

    /// Busiest sources first.
    pub fn top(&self, limit: usize) -> Vec<(Source, SourceStats)> {
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        sources.sort_by(|a, b| b.1.packets.cmp(&a.1.packets));
        sources.truncate(limit);
        sources
    }

    /// Drops sources whose last record is older than `timeout`. Returns how
    /// many were removed.
    pub fn prune_stale(&self, timeout: Duration, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(timeout.as_millis() as i64);
        // The reader keeps inserting while this runs, so the map length
        // before and after says nothing about what was removed.
        let mut removed = 0;
        self.sources.retain(|_, stats| {
            let keep = stats.last_seen >= cutoff;
            removed += usize::from(!keep);
            keep
        });
        removed
    }

    pub fn is_reader_alive(&self) -> bool {
        self.reader_alive.load(Ordering::Relaxed)
    }

    pub fn mark_reader_stopped(&self) {
        self.reader_alive.store(false, Ordering::Relaxed);
    }
}
