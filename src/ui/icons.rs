//! Emoji used across terminal output, with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Execution flow
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
pub static GATE: Emoji<'_, '_> = Emoji("🚦 ", "[GATE]");
pub static SYNC: Emoji<'_, '_> = Emoji("🔀 ", "[SYNC]");

// Tool use
pub static READ: Emoji<'_, '_> = Emoji("📖 ", "[R]");
pub static WRITE: Emoji<'_, '_> = Emoji("📝 ", "[W]");
pub static SHELL: Emoji<'_, '_> = Emoji("💻 ", "[$]");
pub static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[?]");
pub static TOOL: Emoji<'_, '_> = Emoji("🔧 ", "[T]");

/// Icon for an agent tool by name.
pub fn tool_emoji(name: &str) -> Emoji<'static, 'static> {
    match name {
        "Read" => READ,
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => WRITE,
        "Bash" => SHELL,
        "Glob" | "Grep" | "WebSearch" => SEARCH,
        _ => TOOL,
    }
}
