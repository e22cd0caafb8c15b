use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::config::Verbosity;
use crate::events::{EventPublisher, ExecutionEvent};
use crate::plan::display_name;
use crate::stream::truncate_str;
use crate::ui::icons::{
    BLOCKER, CHECK, CROSS, GATE, PAUSE, RETRY, RUNNING, SPARKLE, SYNC, WARN, tool_emoji,
};
use crate::ui::summary::{format_tokens, short_sha};

/// Terminal renderer for execution events.
///
/// One spinner tracks the running phase. Tool use and phase transitions are
/// printed above it; agent text is printed only in verbose mode. Quiet mode
/// hides the spinner and prints only failures and blocks.
pub struct ConsolePublisher {
    multi: MultiProgress,
    spinner: Mutex<Option<ProgressBar>>,
    verbosity: Verbosity,
}

impl ConsolePublisher {
    pub fn new(verbosity: Verbosity) -> Self {
        let multi = if verbosity == Verbosity::Quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            spinner: Mutex::new(None),
            verbosity,
        }
    }

    /// Print above the spinner, falling back to stderr if the draw target is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.verbosity == Verbosity::Quiet || self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn info(&self, msg: impl AsRef<str>) {
        if self.verbosity > Verbosity::Quiet {
            self.print_line(msg);
        }
    }

    fn start_spinner(&self, phase: &str, attempt: u32) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        if let Ok(spinner_style) =
            ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {msg}")
        {
            bar.set_style(spinner_style);
        }
        bar.set_prefix(display_name(phase));
        let label = if attempt > 1 {
            format!("attempt {}", attempt)
        } else {
            "starting".to_string()
        };
        bar.set_message(style(label).dim().to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut slot) = self.spinner.lock()
            && let Some(old) = slot.replace(bar)
        {
            old.finish_and_clear();
        }
    }

    fn set_spinner_message(&self, msg: String) {
        if let Ok(slot) = self.spinner.lock()
            && let Some(bar) = slot.as_ref()
        {
            bar.set_message(msg);
        }
    }

    fn stop_spinner(&self) {
        if let Ok(mut slot) = self.spinner.lock()
            && let Some(bar) = slot.take()
        {
            bar.finish_and_clear();
        }
    }

    fn phase_header(&self, phase: &str) {
        self.info("");
        self.info(format!(
            "{}Phase {}",
            RUNNING,
            style(display_name(phase)).yellow().bold()
        ));
    }
}

impl EventPublisher for ConsolePublisher {
    fn publish(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::PhaseStarted { phase, attempt, .. } => {
                self.phase_header(phase);
                self.start_spinner(phase, *attempt);
            }
            ExecutionEvent::AgentOutput { text, .. } => {
                let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                if line.is_empty() {
                    return;
                }
                self.set_spinner_message(style(truncate_str(line, 60)).dim().to_string());
                if self.verbosity == Verbosity::Verbose {
                    self.print_line(format!("    {}", style(truncate_str(line, 100)).dim()));
                }
            }
            ExecutionEvent::ToolUse {
                name, description, ..
            } => {
                let emoji = tool_emoji(name);
                self.set_spinner_message(format!("{}{}", emoji, style(description).yellow()));
                self.info(format!("    {}{}", emoji, style(description).yellow()));
            }
            ExecutionEvent::Usage { tokens, .. } => {
                if self.verbosity == Verbosity::Verbose {
                    self.set_spinner_message(
                        style(format!("{} tokens", format_tokens(tokens.total())))
                            .dim()
                            .to_string(),
                    );
                }
            }
            ExecutionEvent::GateEvaluated {
                phase,
                kind,
                approved,
                reason,
                ..
            } => {
                let verdict = if *approved {
                    style("approved").green()
                } else {
                    style("rejected").red()
                };
                self.info(format!(
                    "  {}{} gate {} {}: {}",
                    GATE,
                    kind,
                    verdict,
                    display_name(phase),
                    style(reason).dim()
                ));
            }
            ExecutionEvent::PhaseCompleted { phase, commit, .. } => {
                self.stop_spinner();
                let commit = commit
                    .as_deref()
                    .map(|sha| format!(" ({})", style(short_sha(sha)).dim()))
                    .unwrap_or_default();
                self.info(format!(
                    "{}Phase {} complete{}",
                    CHECK,
                    style(display_name(phase)).green().bold(),
                    commit
                ));
            }
            ExecutionEvent::PhaseFailed { phase, error, .. } => {
                self.stop_spinner();
                self.print_line(format!(
                    "{}Phase {} failed: {}",
                    CROSS,
                    style(display_name(phase)).red().bold(),
                    error
                ));
            }
            ExecutionEvent::PhaseRetrying {
                from, to, attempt, ..
            } => {
                self.info(format!(
                    "{}Retrying from {} after {} failed (attempt {})",
                    RETRY,
                    style(display_name(to)).yellow(),
                    display_name(from),
                    attempt
                ));
            }
            ExecutionEvent::Warning { message, .. } => {
                self.print_line(format!("{}{}", WARN, style(message).yellow()));
            }
            ExecutionEvent::Finalize { message, .. } => {
                self.set_spinner_message(message.clone());
                self.info(format!("  {}{}", SYNC, message));
            }
            ExecutionEvent::TaskBlocked { task_id, reason } => {
                self.stop_spinner();
                self.print_line(format!(
                    "\n{}{} blocked: {}",
                    BLOCKER,
                    style(task_id).bold(),
                    style(reason).red()
                ));
            }
            ExecutionEvent::TaskInterrupted { task_id, phase } => {
                self.stop_spinner();
                self.print_line(format!(
                    "\n{}{} interrupted during {}",
                    PAUSE,
                    style(task_id).bold(),
                    display_name(phase)
                ));
            }
            ExecutionEvent::TaskCompleted { task_id } => {
                self.stop_spinner();
                self.info(format!(
                    "\n{}Task {} complete!",
                    SPARKLE,
                    style(task_id).green().bold()
                ));
            }
            ExecutionEvent::TaskFailed { task_id, error } => {
                self.stop_spinner();
                self.print_line(format!(
                    "\n{}Task {} failed: {}",
                    CROSS,
                    style(task_id).red().bold(),
                    error
                ));
            }
        }
    }
}
