//! Terminal progress for the command-line tools.
//!
//! Pretty output (spinners, an interval bar) goes to stderr only when stderr
//! is a TTY; otherwise every stage and progress step is a plain line, so logs
//! and CI output stay readable.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    stdout_redirected: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, stdout_redirected: bool) -> Self {
        Self {
            mode,
            is_tty,
            stdout_redirected,
        }
    }

    /// `--ui` flag plus terminal facts. In `auto` mode a redirected stdout
    /// turns the spinners off.
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, stdout_redirected: bool) -> Self {
        Self::new(UiMode::parse(ui_flag), is_tty, stdout_redirected)
    }

    pub fn is_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.stdout_redirected,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if !self.is_pretty() {
            eprintln!("==> {}", name);
            return StageGuard::new(name.to_string(), None);
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(format!("{name}…"));
        StageGuard::new(name.to_string(), Some(spinner))
    }

    /// Counter for `total` intervals.
    pub fn intervals(&self, total: usize) -> IntervalProgress {
        let bar = self.is_pretty().then(|| {
            let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{bar:32} {pos}/{len} intervals ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        });
        IntervalProgress {
            bar,
            total,
            last_plain: 0,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

/// Interval counter. Plain mode prints at every 10% step.
pub struct IntervalProgress {
    bar: Option<ProgressBar>,
    total: usize,
    last_plain: usize,
}

impl IntervalProgress {
    pub fn update(&mut self, done: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(done as u64);
            return;
        }
        let decile = plain_decile(done, self.total);
        if decile > self.last_plain {
            self.last_plain = decile;
            eprintln!("    {}/{} intervals", done, self.total);
        }
    }

    pub fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

fn plain_decile(done: usize, total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    done.min(total) * 10 / total
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
