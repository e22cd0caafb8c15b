use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::state::retry::truncate_tail;

/// Marker the phase prompt asks the agent to print when it is done.
pub const COMPLETION_MARKER: &str = "<phase_complete>true</phase_complete>";

/// How much command output a rejection quotes.
const COMMAND_OUTPUT_TAIL: usize = 2_000;

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*(error|fatal)(\[[^\]]*\])?:|panicked at").unwrap());

/// A single check an `auto` gate applies to phase output.
///
/// Written in config as a string: `has_output`, `no_errors`,
/// `completion_marker`, `contains:<text>`, `matches:<regex>` or
/// `command:<shell command>`. A command passes when it exits 0 in the
/// task's working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AutoCriterion {
    HasOutput,
    NoErrors,
    CompletionMarker,
    Contains(String),
    Matches(Regex),
    Command(String),
}

/// Where and how long `command:` criteria may run.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub working_dir: &'a Path,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

impl AutoCriterion {
    /// `Err` carries why the output fails this criterion.
    pub async fn check(&self, output: &str, ctx: &CheckContext<'_>) -> Result<(), String> {
        match self {
            AutoCriterion::HasOutput => {
                if output.trim().is_empty() {
                    Err("phase produced no output".to_string())
                } else {
                    Ok(())
                }
            }
            AutoCriterion::NoErrors => match ERROR_LINE.find(output) {
                Some(m) => Err(format!("output reports an error: '{}'", m.as_str().trim())),
                None => Ok(()),
            },
            AutoCriterion::CompletionMarker => {
                if output.contains(COMPLETION_MARKER) {
                    Ok(())
                } else {
                    Err("completion marker not found".to_string())
                }
            }
            AutoCriterion::Contains(needle) => {
                if output.contains(needle.as_str()) {
                    Ok(())
                } else {
                    Err(format!("output does not contain '{}'", needle))
                }
            }
            AutoCriterion::Matches(re) => {
                if re.is_match(output) {
                    Ok(())
                } else {
                    Err(format!("output does not match /{}/", re.as_str()))
                }
            }
            AutoCriterion::Command(cmd) => run_command(cmd, ctx).await,
        }
    }
}

async fn run_command(cmd: &str, ctx: &CheckContext<'_>) -> Result<(), String> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(ctx.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("could not start `{}`: {}", cmd, e))?;

    let finished = tokio::select! {
        result = tokio::time::timeout(ctx.timeout, child.wait_with_output()) => result,
        _ = ctx.cancel.cancelled() => return Err(format!("`{}` cancelled", cmd)),
    };
    let output = match finished {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("`{}` failed to run: {}", cmd, e)),
        Err(_) => {
            return Err(format!(
                "`{}` timed out after {}s",
                cmd,
                ctx.timeout.as_secs()
            ));
        }
    };
    if output.status.success() {
        return Ok(());
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let tail = truncate_tail(text.trim(), COMMAND_OUTPUT_TAIL);
    if tail.is_empty() {
        Err(format!("`{}` exited with {}", cmd, code))
    } else {
        Err(format!("`{}` exited with {}:\n{}", cmd, code, tail))
    }
}

impl fmt::Display for AutoCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoCriterion::HasOutput => write!(f, "has_output"),
            AutoCriterion::NoErrors => write!(f, "no_errors"),
            AutoCriterion::CompletionMarker => write!(f, "completion_marker"),
            AutoCriterion::Contains(s) => write!(f, "contains:{}", s),
            AutoCriterion::Matches(re) => write!(f, "matches:{}", re.as_str()),
            AutoCriterion::Command(cmd) => write!(f, "command:{}", cmd),
        }
    }
}

impl FromStr for AutoCriterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(needle) = s.strip_prefix("contains:") {
            return Ok(AutoCriterion::Contains(needle.to_string()));
        }
        if let Some(cmd) = s.strip_prefix("command:") {
            if cmd.trim().is_empty() {
                return Err(format!("empty command in '{}'", s));
            }
            return Ok(AutoCriterion::Command(cmd.to_string()));
        }
        if let Some(pattern) = s.strip_prefix("matches:") {
            return Regex::new(pattern)
                .map(AutoCriterion::Matches)
                .map_err(|e| format!("invalid regex in '{}': {}", s, e));
        }
        match s.trim() {
            "has_output" => Ok(AutoCriterion::HasOutput),
            "no_errors" => Ok(AutoCriterion::NoErrors),
            "completion_marker" => Ok(AutoCriterion::CompletionMarker),
            other => Err(format!(
                "Invalid criterion '{}'. Valid values: has_output, no_errors, completion_marker, contains:<text>, matches:<regex>, command:<cmd>",
                other
            )),
        }
    }
}

impl TryFrom<String> for AutoCriterion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AutoCriterion> for String {
    fn from(value: AutoCriterion) -> Self {
        value.to_string()
    }
}

/// Apply every criterion in order; the first failure rejects.
pub async fn evaluate_criteria(
    criteria: &[AutoCriterion],
    output: &str,
    ctx: &CheckContext<'_>,
) -> (bool, String) {
    for criterion in criteria {
        if let Err(why) = criterion.check(output, ctx).await {
            return (false, format!("{} failed: {}", criterion, why));
        }
    }
    if criteria.is_empty() {
        (true, "phase succeeded".to_string())
    } else {
        (true, format!("{} criteria passed", criteria.len()))
    }
}
