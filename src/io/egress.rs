//! Record egress - appends analytics records to file
//!
//! Records are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::io::egress_channel::SiteRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Egress writer for analytics records
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a record to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_record(&self, record: &SiteRecord) -> bool {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!(id = %record.id, error = %e, "record_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(id = %record.id, kind = %record.kind(), "record_egressed");
                true
            }
            Err(e) => {
                error!(id = %record.id, kind = %record.kind(), error = %e, "record_egress_failed");
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Write multiple records
    pub fn write_records(&self, records: &[SiteRecord]) -> usize {
        records.iter().filter(|r| self.write_record(r)).count()
    }

    /// Consume records until the channel closes or shutdown is signalled.
    /// Queued records are written before returning.
    pub async fn run(self, mut rx: mpsc::Receiver<SiteRecord>, mut shutdown: watch::Receiver<bool>) {
        info!(file_path = %self.file_path, "egress_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let mut drained = 0usize;
                        while let Ok(record) = rx.try_recv() {
                            self.write_record(&record);
                            drained += 1;
                        }
                        info!(drained = %drained, "egress_shutdown");
                        return;
                    }
                }
                record = rx.recv() => {
                    match record {
                        Some(record) => {
                            self.write_record(&record);
                        }
                        None => {
                            info!("egress_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
