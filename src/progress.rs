//! Progress reporting: the step-oriented UI capability consumed by the
//! host bootstrapper and the long-running verbs, plus the `--progress`
//! mode switch.

use std::io::IsTerminal;
use std::time::Duration;

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};

/// The `--progress` global flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
    /// Spinner on a terminal, plain lines otherwise.
    #[default]
    Auto,
    /// Force the spinner UI.
    Tty,
    /// Force plain line output.
    Plain,
    /// No progress output at all.
    Quiet,
}

impl ProgressMode {
    fn resolved(self) -> Self {
        match self {
            Self::Auto => {
                if std::io::stderr().is_terminal() {
                    Self::Tty
                } else {
                    Self::Plain
                }
            }
            other => other,
        }
    }
}

/// Step-oriented progress with the ability to get out of the way of an
/// interactive subprocess (ssh password prompts, remote shells).
pub trait SuspendableProgressUi {
    fn start_step(&mut self, title: &str);
    fn update_detail(&mut self, detail: &str);
    fn done_step(&mut self);
    fn fail_step(&mut self, reason: &str);
    /// Clear any live output so a subprocess can own the terminal.
    fn suspend(&mut self);
    /// Resume after a `suspend`.
    fn resume(&mut self);
}

/// Build the UI for a progress mode.
pub fn ui_for(mode: ProgressMode) -> Box<dyn SuspendableProgressUi> {
    match mode.resolved() {
        ProgressMode::Tty => Box::new(SpinnerUi::default()),
        ProgressMode::Plain => Box::new(PlainUi { current: None }),
        ProgressMode::Quiet => Box::new(QuietUi),
        ProgressMode::Auto => unreachable!("resolved() never returns Auto"),
    }
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.blue} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb
}

#[derive(Default)]
struct SpinnerUi {
    bar: Option<ProgressBar>,
    title: String,
    suspended: bool,
}

impl SuspendableProgressUi for SpinnerUi {
    fn start_step(&mut self, title: &str) {
        self.finish_current(true);
        self.title = title.to_string();
        if !self.suspended {
            self.bar = Some(make_spinner(title));
        }
    }

    fn update_detail(&mut self, detail: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} — {detail}", self.title));
        }
    }

    fn done_step(&mut self) {
        self.finish_current(true);
    }

    fn fail_step(&mut self, reason: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("✘ {} ({reason})", self.title));
        } else {
            eprintln!("✘ {} ({reason})", self.title);
        }
    }

    fn suspend(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        self.suspended = true;
    }

    fn resume(&mut self) {
        self.suspended = false;
        if !self.title.is_empty() {
            self.bar = Some(make_spinner(&self.title));
        }
    }
}

impl SpinnerUi {
    fn finish_current(&mut self, ok: bool) {
        if let Some(bar) = self.bar.take() {
            if ok {
                bar.finish_with_message(format!("✔ {}", self.title));
            } else {
                bar.finish_and_clear();
            }
        }
    }
}

struct PlainUi {
    current: Option<String>,
}

impl SuspendableProgressUi for PlainUi {
    fn start_step(&mut self, title: &str) {
        eprintln!("{title}...");
        self.current = Some(title.to_string());
    }

    fn update_detail(&mut self, detail: &str) {
        if let Some(title) = &self.current {
            eprintln!("{title}: {detail}");
        }
    }

    fn done_step(&mut self) {
        if let Some(title) = self.current.take() {
            eprintln!("{title}: done");
        }
    }

    fn fail_step(&mut self, reason: &str) {
        if let Some(title) = self.current.take() {
            eprintln!("{title}: failed ({reason})");
        }
    }

    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

struct QuietUi;

impl SuspendableProgressUi for QuietUi {
    fn start_step(&mut self, _title: &str) {}
    fn update_detail(&mut self, _detail: &str) {}
    fn done_step(&mut self) {}
    fn fail_step(&mut self, reason: &str) {
        eprintln!("failed: {reason}");
    }
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

/// Run an operation with a spinner, showing success/failure.
pub fn with_spinner<T, F>(msg: &str, op: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    if crate::prefs::settings().progress == ProgressMode::Quiet
        || !std::io::stderr().is_terminal()
    {
        return op();
    }
    let pb = make_spinner(msg);
    let result = op();
    match &result {
        Ok(_) => pb.finish_with_message(format!("✔ {}", msg)),
        Err(_) => pb.finish_with_message(format!("✘ {}", msg)),
    }
    result
}
