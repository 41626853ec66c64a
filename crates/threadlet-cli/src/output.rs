//! Terminal rendering of simulation reports and check summaries.
//!
//! Colors go through `termcolor`; `NO_COLOR` and `--color` decide whether
//! any are emitted.

use crate::simulate::{Report, ThreadletReport};
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Pick a color mode: `NO_COLOR` wins, then `--color`, then TTY detection.
pub fn resolve_color_choice(flag: Option<&str>) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        Some("always") => ColorChoice::Always,
        Some("never") => ColorChoice::Never,
        _ => ColorChoice::Auto,
    }
}

/// Colored writer over stdout
pub struct StyledOutput {
    stdout: StandardStream,
}

impl StyledOutput {
    /// Create a writer for `choice`
    pub fn new(choice: ColorChoice) -> Self {
        Self {
            stdout: StandardStream::stdout(choice),
        }
    }

    fn write_styled(&mut self, text: &str, color: Option<Color>, bold: bool) {
        let mut spec = ColorSpec::new();
        spec.set_fg(color).set_bold(bold);
        let _ = self.stdout.set_color(&spec);
        let _ = write!(self.stdout, "{}", text);
        let _ = self.stdout.reset();
    }

    /// Success marker (green, bold)
    pub fn success(&mut self, text: &str) {
        self.write_styled(text, Some(Color::Green), true);
    }

    /// Failure marker (red, bold)
    pub fn error(&mut self, text: &str) {
        self.write_styled(text, Some(Color::Red), true);
    }

    /// Pending marker (yellow, bold)
    pub fn warning(&mut self, text: &str) {
        self.write_styled(text, Some(Color::Yellow), true);
    }

    /// Labels and timestamps (cyan)
    pub fn info(&mut self, text: &str) {
        self.write_styled(text, Some(Color::Cyan), false);
    }

    /// Headings
    pub fn bold(&mut self, text: &str) {
        self.write_styled(text, None, true);
    }

    pub fn plain(&mut self, text: &str) {
        let _ = write!(self.stdout, "{}", text);
    }

    pub fn newline(&mut self) {
        let _ = writeln!(self.stdout);
    }

    pub fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    // ── Report ───────────────────────────────────────────────────────

    /// Print a full simulation report
    pub fn report(&mut self, report: &Report) {
        self.bold("Simulation");
        self.plain(&format!(
            "  {} clock, seed {}, {:.3} ms elapsed",
            report.clock, report.seed, report.elapsed_ms
        ));
        self.newline();

        let s = &report.stats;
        self.info("  dispatches ");
        self.plain(&s.dispatches.to_string());
        self.info("  requeued ");
        self.plain(&s.fast_requeues.to_string());
        self.info("  deferred ");
        self.plain(&s.deferrals.to_string());
        self.info("  demoted ");
        self.plain(&s.demotions.to_string());
        self.info("  promotions ");
        self.plain(&s.promotions.to_string());
        self.newline();
        self.newline();

        for t in &report.threadlets {
            self.threadlet(t);
        }

        if let Some(timeline) = &report.timeline {
            self.newline();
            self.bold("Timeline");
            self.newline();
            self.plain(&format!("  {}", timeline.join(" ")));
            self.newline();
        }

        self.newline();
        match report.rejected() {
            0 => self.success("All tasks resolved"),
            n => self.error(&format!("{} task(s) rejected", n)),
        }
        self.newline();
        self.flush();
    }

    fn threadlet(&mut self, t: &ThreadletReport) {
        self.bold(&t.name);
        self.plain(&format!(
            " [{}] {} dispatches, {} steps",
            t.priority, t.dispatches, t.steps
        ));
        if let (Some(first), Some(last)) = (t.first_dispatch_ms, t.last_dispatch_ms) {
            self.plain(&format!(", active {:.3}..{:.3} ms", first, last));
        }
        self.newline();

        for task in &t.tasks {
            self.plain(&format!("  #{} ", task.index + 1));
            match task.outcome {
                "resolved" => self.success("resolved"),
                "rejected" => self.error("rejected"),
                other => self.warning(other),
            }
            if let Some(v) = &task.value {
                self.plain(&format!(" {}", v));
            }
            if let Some(at) = task.settled_at_ms {
                self.info(&format!(" @ {:.3} ms", at));
            }
            self.newline();
        }
    }
}
