//! Terminal-friendly rendering of bus events and execution errors.
//!
//! Mirrors the crate's structured-logging surface (`tracing`) with a second,
//! human-oriented formatter used by CLIs and debugging tools that want a
//! readable dump without wiring up a `tracing-subscriber` layer.

use crate::errors::ExecutionError;
use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Explicit color control for [`pretty_print_with_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Detect color support from whether stderr is a TTY.
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    fn colored(self) -> bool {
        match self {
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
            FormatterMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

/// Rendered output for a telemetry item that can be consumed by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ExecutionError]) -> Vec<EventRender>;
}

pub struct PlainFormatter {
    mode: FormatterMode,
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::with_mode(FormatterMode::Auto)
    }
}

impl PlainFormatter {
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn wrap(&self, color: &str, body: &str) -> String {
        if self.mode.colored() {
            format!("{color}{body}{RESET_COLOR}\n")
        } else {
            format!("{body}\n")
        }
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = self.wrap(LINE_COLOR, &format!("{event}"));
        EventRender {
            context: Some(event.event_type.clone()),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ExecutionError]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut lines = Vec::new();
                let scope = e.node_id.as_deref().unwrap_or("execution");
                lines.push(self.wrap(
                    CONTEXT_COLOR,
                    &format!("[{i}] {} | {:?} @ {}", scope, e.kind, e.when),
                ));
                lines.push(self.wrap(LINE_COLOR, &format!("  error: {}", e.message)));
                if !e.details.is_null() {
                    lines.push(self.wrap(LINE_COLOR, &format!("  details: {}", e.details)));
                }
                EventRender {
                    context: Some(scope.to_string()),
                    lines,
                }
            })
            .collect()
    }
}

pub fn pretty_print_with_mode(errors: &[ExecutionError], mode: FormatterMode) -> String {
    let formatter = PlainFormatter::with_mode(mode);
    formatter
        .render_errors(errors)
        .into_iter()
        .map(|r| r.join_lines())
        .collect()
}

pub fn pretty_print(errors: &[ExecutionError]) -> String {
    pretty_print_with_mode(errors, FormatterMode::Auto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn plain_mode_has_no_ansi_codes() {
        let errors = vec![ExecutionError::new(ErrorKind::Timeout, "boom")];
        let out = pretty_print_with_mode(&errors, FormatterMode::Plain);
        assert!(!out.contains("\x1b["));
        assert!(out.contains("boom"));
    }

    #[test]
    fn colored_mode_includes_ansi_codes() {
        let errors = vec![ExecutionError::new(ErrorKind::Timeout, "boom")];
        let out = pretty_print_with_mode(&errors, FormatterMode::Colored);
        assert!(out.contains("\x1b["));
    }
}
