//! Delivery of run reports to an external channel.
//!
//! Failures here are reported back to the orchestrator, which logs them as
//! warnings; they never change the outcome of a run.

use crate::config::{NotifyConfig, NotifyKind};
use crate::process::command_from_argv;
use crate::report::{Outcome, RunReport};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Telegram rejects longer messages; leave room for formatting
pub const MAX_MESSAGE_LENGTH: usize = 4000;

const PRE_OVERHEAD: usize = "<pre></pre>".len();
const PART_PREFIX_RESERVE: usize = 32;
/// Failure reasons carry raw stderr; the full text is in the log below
const MAX_REASON_CHARS: usize = 500;
const MIN_CHUNK_BUDGET: usize = 1000;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, report: &RunReport) -> Result<()>;
}

/// Build the configured sink, `None` when notifications are off
pub fn sink_for(config: &NotifyConfig, timeout: Duration) -> Result<Option<Box<dyn NotificationSink>>> {
    let sink: Box<dyn NotificationSink> = match config.kind {
        NotifyKind::None => return Ok(None),
        NotifyKind::Telegram => {
            let (bot_token, chat_id) = config.telegram_credentials()?;
            Box::new(TelegramSink::new(bot_token, chat_id, timeout))
        }
        NotifyKind::Command => Box::new(CommandSink::new(config.command.clone())),
    };
    Ok(Some(sink))
}

/// Posts the report to a Telegram chat through the Bot API
#[derive(Debug, Clone)]
pub struct TelegramSink {
    bot_token: String,
    chat_id: String,
    timeout: Duration,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String, timeout: Duration) -> Self {
        Self {
            bot_token,
            chat_id,
            timeout,
        }
    }

    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let mut child = tokio::process::Command::new("curl")
            .args(["-sS", "--fail", "-X", "POST"])
            .args(["--max-time", &self.timeout.as_secs().max(1).to_string()])
            .args(["-H", "Content-Type: application/json"])
            .args(["--data-binary", "@-"])
            .arg(&url)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::notification(format!("Failed to execute curl: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.to_string().as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::notification(format!(
                "Failed to send Telegram message: {}",
                stderr.trim().replace(&self.bot_token, "***")
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        let messages = format_telegram_messages(report);
        debug!("Sending report as {} Telegram message(s)", messages.len());
        for message in &messages {
            self.send(message).await?;
        }
        Ok(())
    }
}

/// Runs a notifier program with the run's log file as last argument.
/// `BACKUP_OUTCOME` and `BACKUP_RUN_ID` are set in its environment.
#[derive(Debug, Clone)]
pub struct CommandSink {
    argv: Vec<String>,
}

impl CommandSink {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl NotificationSink for CommandSink {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        let log_file = report
            .log_file
            .as_ref()
            .ok_or_else(|| Error::notification("run has no log file to hand to the notifier"))?;
        let mut cmd = command_from_argv(&self.argv)
            .ok_or_else(|| Error::notification("notifier command is empty"))?;

        let outcome = match report.outcome {
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::Failed { .. } => "failed",
        };
        cmd.arg(log_file)
            .env("BACKUP_OUTCOME", outcome)
            .env("BACKUP_RUN_ID", report.run_id.to_string());

        let output = crate::process::run_captured(&mut cmd)
            .await
            .map_err(|e| Error::notification(format!("Failed to execute notifier: {}", e)))?;

        if !output.success() {
            return Err(Error::notification(output.failure_text()));
        }
        Ok(())
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn status_line(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success => "✅ <b>Status: SUCCESS</b>".to_string(),
        Outcome::Skipped => "ℹ️ <b>Status: SKIPPED (No Changes)</b>".to_string(),
        Outcome::Failed { phase, reason, .. } => format!(
            "❌ <b>Status: FAILED</b> ({}: {})",
            phase,
            escape_html(&truncate_chars(reason, MAX_REASON_CHARS))
        ),
    }
}

fn report_header(report: &RunReport) -> String {
    let log_name = report
        .log_file
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "🔔 <b>Archive Backup Report</b>\n📅 {}\n📋 Log: {}\n{}\n\n{}\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        escape_html(&log_name),
        "=".repeat(40),
        status_line(&report.outcome)
    )
}

/// Render a report as one or more HTML messages no longer than
/// [`MAX_MESSAGE_LENGTH`] characters. Each chunk carries its own `<pre>`
/// block so every message is valid HTML on its own.
pub fn format_telegram_messages(report: &RunReport) -> Vec<String> {
    let header = report_header(report);
    let log = escape_html(&report.rendered_log());

    let single = format!("{}<pre>{}</pre>", header, log);
    if single.chars().count() <= MAX_MESSAGE_LENGTH {
        return vec![single];
    }

    let budget = MAX_MESSAGE_LENGTH
        .saturating_sub(header.chars().count() + PRE_OVERHEAD + PART_PREFIX_RESERVE)
        .max(MIN_CHUNK_BUDGET);
    let chunks = split_message(&log, budget);
    let total = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let prefix = format!("📄 Part {}/{}\n\n", i + 1, total);
            if i == 0 {
                format!("{}{}<pre>{}</pre>", prefix, header, chunk)
            } else {
                format!("{}<pre>{}</pre>", prefix, chunk)
            }
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

/// Where to cut `chars` so the first part is at most `max` long and does not
/// end inside an HTML entity such as `&amp;`
fn cut_point(chars: &[char], max: usize) -> usize {
    let window = &chars[..max];
    match window.iter().rposition(|&c| c == '&') {
        Some(amp) if amp > 0 && !window[amp..].contains(&';') => amp,
        _ => max,
    }
}

/// Split on line boundaries into chunks of at most `max` characters. A line
/// longer than `max` is cut on character boundaries, never inside an entity.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let mut line_chars: Vec<char> = line.chars().collect();

        while line_chars.len() > max {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = line_chars.split_off(cut_point(&line_chars, max));
            chunks.push(line_chars.into_iter().collect());
            line_chars = rest;
        }

        if current_len + line_chars.len() > max {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += line_chars.len();
        current.extend(line_chars);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Phase;
    use crate::report::{FailureKind, LogLevel, LogLine, RunMode};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn report(outcome: Outcome, lines: usize) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            mode: RunMode::Smart,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome,
            artifact_size: None,
            transferred_size: None,
            committed_watermark: None,
            log: (0..lines)
                .map(|i| LogLine {
                    timestamp: Utc::now(),
                    level: LogLevel::Info,
                    message: format!("line {} <tag> & more", i),
                })
                .collect(),
            log_file: Some(PathBuf::from("/var/log/backup_20240601_020000_abcd1234.log")),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_single_message_status() {
        let messages = format_telegram_messages(&report(Outcome::Success, 3));
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert!(msg.contains("Status: SUCCESS"));
        assert!(msg.contains("backup_20240601_020000_abcd1234.log"));
        assert!(msg.contains("&lt;tag&gt; &amp; more"));
        assert!(!msg.contains("Part 1"));
    }

    #[test]
    fn test_failed_status_names_phase() {
        let outcome = Outcome::Failed {
            phase: Phase::Export,
            kind: FailureKind::Error,
            reason: "disk <full>".to_string(),
        };
        let msg = &format_telegram_messages(&report(outcome, 1))[0];
        assert!(msg.contains("Status: FAILED</b> (export: disk &lt;full&gt;)"));
    }

    #[test]
    fn test_skipped_status() {
        let msg = &format_telegram_messages(&report(Outcome::Skipped, 1))[0];
        assert!(msg.contains("SKIPPED (No Changes)"));
    }

    #[test]
    fn test_long_report_is_split() {
        let messages = format_telegram_messages(&report(Outcome::Success, 400));
        assert!(messages.len() > 1);
        let total = messages.len();
        for (i, msg) in messages.iter().enumerate() {
            assert!(msg.chars().count() <= MAX_MESSAGE_LENGTH);
            assert!(msg.starts_with(&format!("📄 Part {}/{}", i + 1, total)));
            assert_eq!(msg.matches("<pre>").count(), 1);
            assert!(msg.ends_with("</pre>"));
        }
        assert!(messages[0].contains("Archive Backup Report"));
    }

    #[test]
    fn test_huge_failure_reason_stays_within_limit() {
        let outcome = Outcome::Failed {
            phase: Phase::Transfer,
            kind: FailureKind::Error,
            reason: "rsync: <error> & ".repeat(300),
        };
        let mut r = report(outcome, 50);
        r.log.push(LogLine {
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: format!("Backup failed in transfer phase: {}", "rsync: <error> & ".repeat(300)),
        });

        let messages = format_telegram_messages(&r);
        assert!(messages.len() > 1);
        for msg in &messages {
            assert!(msg.chars().count() <= MAX_MESSAGE_LENGTH, "{} chars", msg.chars().count());
        }
        assert!(messages[0].contains("Status: FAILED"));
    }

    #[test]
    fn test_split_message_keeps_entities_whole() {
        let chunks = split_message("ab&amp;cd", 6);
        assert_eq!(chunks, vec!["ab", "&amp;c", "d"]);

        let escaped = escape_html(&"<&>".repeat(50));
        for chunk in split_message(&escaped, 7) {
            assert!(chunk.chars().count() <= 7);
            assert!(!chunk.ends_with('&'));
        }
    }

    #[test]
    fn test_split_message_on_lines() {
        let chunks = split_message("aaa\nbbb\nccc\n", 8);
        assert_eq!(chunks, vec!["aaa\nbbb\n", "ccc\n"]);
    }

    #[test]
    fn test_split_message_cuts_long_line() {
        let chunks = split_message("abcdefghij\nxy", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij\n", "xy"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sink_receives_log_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let log = temp_dir.path().join("backup_x.log");
        std::fs::write(&log, "line\n").unwrap();

        let mut r = report(Outcome::Success, 1);
        r.log_file = Some(log);

        let sink = CommandSink::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"test -f "$1" && test "$BACKUP_OUTCOME" = success"#.to_string(),
            "sh".to_string(),
        ]);
        sink.notify(&r).await.unwrap();

        r.outcome = Outcome::Skipped;
        assert!(matches!(sink.notify(&r).await, Err(Error::Notification { .. })));
    }

    #[test]
    fn test_sink_for_none() {
        let config = NotifyConfig::default();
        assert!(sink_for(&config, Duration::from_secs(5)).unwrap().is_none());
    }
}
