//! Terminal output: live progress while a task runs, and rendered views
//! for `list` and `show`.

pub mod icons;
pub mod progress;
pub mod summary;

pub use progress::ConsolePublisher;
pub use summary::{StatusView, render_guidance, render_status};
