//! Systemd unit generation for periodic runs.
//!
//! Only the unit files are produced here. Triggering, catch-up after downtime
//! and retry on the next cycle are left to systemd itself.

use crate::report::RunMode;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Writes `.service`/`.timer` pairs into an output directory
#[derive(Debug)]
pub struct BackupScheduler {
    output_dir: PathBuf,
}

impl BackupScheduler {
    /// Create a new scheduler writing into `output_dir`
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Generate systemd service and timer units for the schedule
    pub async fn generate_systemd_units(&self, schedule: &BackupSchedule) -> Result<ScheduleOutput> {
        fs::create_dir_all(&self.output_dir).await?;

        let service_path = self.output_dir.join(format!("{}.service", schedule.name));
        let timer_path = self.output_dir.join(format!("{}.timer", schedule.name));

        fs::write(&service_path, self.generate_service_unit(schedule)).await?;
        fs::write(&timer_path, self.generate_timer_unit(schedule)).await?;
        debug!("Wrote {} and {}", service_path.display(), timer_path.display());

        let install_commands = vec![
            format!("sudo cp {} /etc/systemd/system/", service_path.display()),
            format!("sudo cp {} /etc/systemd/system/", timer_path.display()),
            "sudo systemctl daemon-reload".to_string(),
            format!("sudo systemctl enable --now {}.timer", schedule.name),
        ];

        Ok(ScheduleOutput {
            service_path,
            timer_path,
            install_commands,
        })
    }

    fn generate_service_unit(&self, schedule: &BackupSchedule) -> String {
        let mut exec = systemd_quote(&schedule.executable_path.display().to_string());
        if let Some(config) = &schedule.config_path {
            exec.push_str(&format!(" --config {}", systemd_quote(&config.display().to_string())));
        }
        exec.push_str(&format!(" run --mode {}", schedule.mode));

        let user = schedule
            .user
            .as_ref()
            .map(|u| format!("User={}\n", u))
            .unwrap_or_default();

        format!(
            r#"[Unit]
Description={}
Wants=network-online.target
After=network-online.target

[Service]
Type=oneshot
{}ExecStart={}
WorkingDirectory={}
TimeoutStartSec={}

StandardOutput=journal
StandardError=journal
SyslogIdentifier={}
"#,
            schedule.description,
            user,
            exec,
            schedule.working_directory.display(),
            schedule.timeout_start_sec,
            schedule.name
        )
    }

    fn generate_timer_unit(&self, schedule: &BackupSchedule) -> String {
        format!(
            r#"[Unit]
Description=Timer for {}

[Timer]
OnCalendar={}
Persistent=true
RandomizedDelaySec={}
Unit={}.service

[Install]
WantedBy=timers.target
"#,
            schedule.description, schedule.on_calendar, schedule.randomized_delay_sec, schedule.name
        )
    }

    /// Non-fatal problems with a schedule, one message each
    pub fn validate_schedule(&self, schedule: &BackupSchedule) -> Vec<String> {
        let mut warnings = Vec::new();

        if !schedule.executable_path.exists() {
            warnings.push(format!(
                "Executable not found: {}",
                schedule.executable_path.display()
            ));
        }

        if let Some(config) = &schedule.config_path {
            if !config.exists() {
                warnings.push(format!("Config file not found: {}", config.display()));
            }
        }

        if !is_valid_systemd_calendar(&schedule.on_calendar) {
            warnings.push(format!(
                "Invalid systemd calendar expression: {}",
                schedule.on_calendar
            ));
        }

        if schedule.mode == RunMode::Full {
            warnings.push("Scheduled full runs export even when nothing changed".to_string());
        }

        warnings
    }
}

/// Loose check; `systemd-analyze calendar` is the authority
fn is_valid_systemd_calendar(expression: &str) -> bool {
    const SHORTHANDS: &[&str] = &[
        "minutely",
        "hourly",
        "daily",
        "weekly",
        "monthly",
        "yearly",
        "annually",
        "quarterly",
        "semiannually",
    ];

    let expression = expression.trim();
    !expression.is_empty() && (SHORTHANDS.contains(&expression) || expression.contains(':'))
}

/// One scheduled invocation of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    /// Unit name without suffix
    pub name: String,
    pub description: String,
    /// Systemd calendar expression, e.g. `daily` or `*-*-* 02:00:00`
    pub on_calendar: String,
    pub executable_path: PathBuf,
    /// Passed as `--config` when set
    pub config_path: Option<PathBuf>,
    pub mode: RunMode,
    pub user: Option<String>,
    pub working_directory: PathBuf,
    pub randomized_delay_sec: u32,
    /// Upper bound systemd enforces on the whole run
    pub timeout_start_sec: u64,
}

impl BackupSchedule {
    /// Create a smart-mode schedule with sensible defaults
    pub fn new(name: &str, executable_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Archive backup ({})", name),
            on_calendar: "*-*-* 02:00:00".to_string(),
            executable_path: executable_path.to_path_buf(),
            config_path: None,
            mode: RunMode::Smart,
            user: None,
            working_directory: PathBuf::from("/"),
            randomized_delay_sec: 300,
            timeout_start_sec: 8 * 60 * 60,
        }
    }

    /// Set custom calendar expression
    pub fn with_schedule(mut self, on_calendar: &str) -> Self {
        self.on_calendar = on_calendar.to_string();
        self
    }

    pub fn with_config(mut self, config_path: &Path) -> Self {
        self.config_path = Some(config_path.to_path_buf());
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }
}

/// Quote one `ExecStart=` word. `%` specifiers and `$` variables are
/// escaped by doubling, even in words that need no quotes.
fn systemd_quote(word: &str) -> String {
    let word = word.replace('%', "%%").replace('$', "$$");
    if !word.is_empty() && !word.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';')) {
        return word;
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('"');
    for c in word.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Output from schedule generation
#[derive(Debug)]
pub struct ScheduleOutput {
    pub service_path: PathBuf,
    pub timer_path: PathBuf,
    pub install_commands: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schedule_creation() {
        let schedule = BackupSchedule::new("archive-backup", Path::new("/usr/local/bin/archive-backup"))
            .with_schedule("daily")
            .with_user("backup")
            .with_mode(RunMode::LocalOnly);

        assert_eq!(schedule.name, "archive-backup");
        assert_eq!(schedule.on_calendar, "daily");
        assert_eq!(schedule.user.as_deref(), Some("backup"));
        assert_eq!(schedule.mode, RunMode::LocalOnly);
    }

    #[test]
    fn test_service_unit_runs_smart_mode() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = BackupScheduler::new(temp_dir.path());
        let schedule = BackupSchedule::new("archive-backup", Path::new("/usr/local/bin/archive-backup"))
            .with_config(Path::new("/etc/archive-backup/config.toml"));

        let service = scheduler.generate_service_unit(&schedule);
        assert!(service.contains("Type=oneshot"));
        assert!(service.contains(
            "ExecStart=/usr/local/bin/archive-backup --config /etc/archive-backup/config.toml run --mode smart"
        ));
        assert!(!service.contains("User="));
    }

    #[test]
    fn test_service_unit_quotes_paths_with_spaces() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = BackupScheduler::new(temp_dir.path());
        let schedule = BackupSchedule::new("archive-backup", Path::new("/opt/my tools/archive-backup"))
            .with_config(Path::new("/srv/backup 100%/config.toml"));

        let service = scheduler.generate_service_unit(&schedule);
        assert!(service.contains(
            "ExecStart=\"/opt/my tools/archive-backup\" --config \"/srv/backup 100%%/config.toml\" run --mode smart"
        ));
    }

    #[test]
    fn test_systemd_quote() {
        assert_eq!(systemd_quote("/usr/bin/archive-backup"), "/usr/bin/archive-backup");
        assert_eq!(systemd_quote("/a b"), "\"/a b\"");
        assert_eq!(systemd_quote("/a\"b"), "\"/a\\\"b\"");
        assert_eq!(systemd_quote("/home/$USER/bin"), "/home/$$USER/bin");
        assert_eq!(systemd_quote(""), "\"\"");
    }

    #[test]
    fn test_timer_unit() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = BackupScheduler::new(temp_dir.path());
        let schedule = BackupSchedule::new("archive-backup", Path::new("/bin/true"));

        let timer = scheduler.generate_timer_unit(&schedule);
        assert!(timer.contains("OnCalendar=*-*-* 02:00:00"));
        assert!(timer.contains("Persistent=true"));
        assert!(timer.contains("RandomizedDelaySec=300"));
        assert!(timer.contains("Unit=archive-backup.service"));
    }

    #[tokio::test]
    async fn test_generate_writes_both_units() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("units");
        let scheduler = BackupScheduler::new(&out);
        let schedule = BackupSchedule::new("nightly", Path::new("/bin/true"));

        let output = scheduler.generate_systemd_units(&schedule).await.unwrap();
        assert_eq!(output.service_path, out.join("nightly.service"));
        assert!(output.timer_path.exists());
        assert!(output
            .install_commands
            .iter()
            .any(|c| c.contains("enable --now nightly.timer")));
    }

    #[test]
    fn test_calendar_validation() {
        assert!(is_valid_systemd_calendar("daily"));
        assert!(is_valid_systemd_calendar("weekly"));
        assert!(is_valid_systemd_calendar("*-*-* 02:00:00"));
        assert!(is_valid_systemd_calendar("Mon *-*-* 10:00:00"));

        assert!(!is_valid_systemd_calendar(""));
        assert!(!is_valid_systemd_calendar("invalid"));
    }

    #[test]
    fn test_schedule_validation() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = BackupScheduler::new(temp_dir.path());

        let missing = temp_dir.path().join("archive-backup");
        let schedule = BackupSchedule::new("nightly", &missing).with_schedule("sometimes");
        let warnings = scheduler.validate_schedule(&schedule);

        assert!(warnings.iter().any(|w| w.contains("Executable not found")));
        assert!(warnings.iter().any(|w| w.contains("Invalid systemd calendar")));
    }
}
