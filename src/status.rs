//! Program status as reported by the supervising process and printed by `top`/`ps`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use strum::{Display, EnumString};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

/// Lifecycle state of one supervised program.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ProgramState {
    Running,
    Stopped,
    Exited,
    /// The command could not be spawned at all.
    Fatal,
}

/// One row of `top`/`ps` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub name: String,
    pub state: ProgramState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Free-form detail such as a spawn error.
    pub detail: Option<String>,
}

impl ProgramStatus {
    /// Human readable description of the state, `supervisorctl status` style.
    pub fn description(&self, now: DateTime<Utc>) -> String {
        match self.state {
            ProgramState::Running => {
                let uptime = self
                    .started_at
                    .and_then(|started| now.signed_duration_since(started).to_std().ok())
                    .map(|elapsed| format_uptime(elapsed.as_secs()))
                    .unwrap_or_else(|| "0:00:00".to_string());
                match self.pid {
                    Some(pid) => format!("pid {pid}, uptime {uptime}"),
                    None => format!("uptime {uptime}"),
                }
            }
            ProgramState::Exited => match self.exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
            ProgramState::Fatal => self
                .detail
                .clone()
                .unwrap_or_else(|| "could not be spawned".to_string()),
            ProgramState::Stopped => "Not started".to_string(),
        }
    }
}

/// Formats seconds as `H:MM:SS`, with a day prefix past 24 hours.
pub fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    if days > 0 {
        format!("{days} days, {hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours}:{minutes:02}:{seconds:02}")
    }
}

fn state_color(state: ProgramState) -> &'static str {
    match state {
        ProgramState::Running => GREEN_BOLD,
        ProgramState::Stopped => YELLOW_BOLD,
        ProgramState::Exited | ProgramState::Fatal => RED_BOLD,
    }
}

/// Renders status rows as an aligned table.
pub fn render_table(rows: &[ProgramStatus], colored: bool, now: DateTime<Utc>) -> String {
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let mut out = String::new();
    for row in rows {
        let state = row.state.to_string();
        let (open, close) = if colored {
            (state_color(row.state), RESET)
        } else {
            ("", "")
        };
        let _ = writeln!(
            out,
            "{:<width$}  {open}{state:<8}{close}  {}",
            row.name,
            row.description(now),
        );
    }
    out
}
