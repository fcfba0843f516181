//! Structured error reports
//!
//! A bounded in-memory log of processing failures, kept alongside the
//! tracing output so operational surfaces can list and alert on recent
//! errors without scraping logs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReportCategory {
    /// Undecodable or unwanted payloads
    Codec,
    /// Login-record reads and writes
    Datastore,
    /// Outbound topic publishes
    Publish,
    /// Catalog cache refreshes
    CacheRefresh,
    /// Upstream queue polling
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReportSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub category: ReportCategory,
    pub severity: ReportSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        category: ReportCategory,
        severity: ReportSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
        }
    }
}

pub struct ReportLog {
    max_entries: usize,
    entries: RwLock<VecDeque<Report>>,
}

impl ReportLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub fn report(
        &self,
        category: ReportCategory,
        severity: ReportSeverity,
        message: String,
        source: &str,
    ) {
        let mut entries = self.entries.write();
        entries.push_back(Report::new(category, severity, message, source.to_string()));
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Most recent reports, newest first
    pub fn recent(&self, limit: usize) -> Vec<Report> {
        self.entries
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ReportLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_and_newest_first() {
        let log = ReportLog::new(2);
        for i in 0..3 {
            log.report(
                ReportCategory::Publish,
                ReportSeverity::Error,
                format!("failure {i}"),
                "test",
            );
        }

        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].message, "failure 2");
        assert_eq!(recent[1].message, "failure 1");
    }

    #[test]
    fn severity_orders() {
        assert!(ReportSeverity::Critical > ReportSeverity::Error);
        assert!(ReportSeverity::Error > ReportSeverity::Warn);
    }
}
