//! Change detection against the archive's own modification record.
//!
//! Known gap: a single global watermark only sees rows whose `added` or
//! `modified` column moved. Deleting documents, or metadata edits that do not
//! touch those columns, do not trigger a smart run.

use crate::config::ArchiveConfig;
use crate::process::{run_captured, ComposeRuntime};
use crate::watermark::Watermark;
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Source of the most recent content-modification watermark
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Maximum "added or modified" value across all documents, or
    /// [`Watermark::Epoch`] when the archive is empty.
    async fn latest_change(&self) -> Result<Watermark>;
}

/// A run is warranted only when something changed strictly after the last
/// committed watermark.
pub fn should_run(latest: &Watermark, last_committed: &Watermark) -> bool {
    latest > last_committed
}

/// Queries the archive database through `psql` inside its container
#[derive(Debug, Clone)]
pub struct DatabaseChangeDetector {
    runtime: ComposeRuntime,
    db_service: String,
    db_user: String,
    db_name: String,
    query: String,
}

impl DatabaseChangeDetector {
    pub fn new(archive: &ArchiveConfig) -> Self {
        Self {
            runtime: ComposeRuntime::from_config(archive),
            db_service: archive.db_service.clone(),
            db_user: archive.db_user.clone(),
            db_name: archive.db_name.clone(),
            query: archive.change_query.clone(),
        }
    }
}

#[async_trait]
impl ChangeDetector for DatabaseChangeDetector {
    async fn latest_change(&self) -> Result<Watermark> {
        let mut cmd = self.runtime.exec(
            &self.db_service,
            &[
                "psql",
                "-U",
                &self.db_user,
                "-d",
                &self.db_name,
                "-t",
                "-A",
                "-c",
                &self.query,
            ],
        );

        let output = run_captured(&mut cmd)
            .await
            .map_err(|e| Error::detection(format!("Failed to execute psql: {}", e)))?;

        if !output.success() {
            return Err(Error::detection(format!(
                "psql query failed: {}",
                output.failure_text()
            )));
        }

        let latest = parse_query_output(&output.stdout);
        debug!("Latest change in archive: {}", latest);
        Ok(latest)
    }
}

/// First non-blank line of tuples-only psql output. No rows or a NULL
/// aggregate both come back blank.
pub fn parse_query_output(stdout: &str) -> Watermark {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(Watermark::parse)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_run_is_strict() {
        let a = Watermark::parse("2024-01-01");
        let b = Watermark::parse("2024-06-01");
        assert!(should_run(&b, &a));
        assert!(!should_run(&b, &b));
        assert!(!should_run(&a, &b));
    }

    #[test]
    fn test_should_run_over_ordered_pairs() {
        let values: Vec<Watermark> = ["", "2023-12-31", "2024-01-01", "2024-01-01 00:00:00.5", "2024-06-01"]
            .iter()
            .map(|raw| Watermark::parse(raw))
            .collect();

        for (i, a) in values.iter().enumerate() {
            for b in &values[i..] {
                assert_eq!(should_run(b, a), a < b, "latest={} last={}", b, a);
            }
        }
    }

    #[test]
    fn test_should_run_numeric() {
        assert!(should_run(&Watermark::parse("10"), &Watermark::parse("9")));
        assert!(!should_run(&Watermark::parse("9"), &Watermark::parse("9")));
    }

    #[test]
    fn test_parse_query_output() {
        assert_eq!(
            parse_query_output("\n 2024-06-01 10:00:00.123+00 \n\n"),
            Watermark::parse("2024-06-01 10:00:00.123+00")
        );
        assert_eq!(parse_query_output(""), Watermark::Epoch);
        assert_eq!(parse_query_output("\n\n"), Watermark::Epoch);
    }
}
