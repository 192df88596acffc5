//! Progress lines on stderr. Diagnostics go through `log` instead, and stdout
//! is reserved for the JSON report.

use std::{fmt::Display, time::Instant};

use console::{StyledObject, style};
use indicatif::HumanDuration;

/// Fits the longest stage label, "Benchmarking".
const LABEL_WIDTH: usize = 12;

fn tagged(tag: StyledObject<&str>, message: impl Display) {
    eprintln!("{}: {message}", tag.bold());
}

pub fn status(label: &str, message: impl Display) {
    eprintln!("{:>LABEL_WIDTH$} {message}", style(label).green().bold());
}

pub fn warn(message: impl Display) {
    tagged(style("warning").yellow(), message);
}

pub fn error(message: impl Display) {
    tagged(style("error").red(), message);
}

pub fn note(message: impl Display) {
    tagged(style("note").blue(), message);
}

/// A detail line, indented to sit under the last status message.
pub fn step(message: impl Display) {
    eprintln!("{:LABEL_WIDTH$} {message}", "");
}

/// A pipeline stage announced on start and timed until [`Stage::done`].
pub struct Stage {
    label: &'static str,
    started: Instant,
}

impl Stage {
    pub fn start(label: &'static str, message: impl Display) -> Self {
        status(label, message);
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn done(self) {
        let elapsed = HumanDuration(self.started.elapsed());
        log::info!("{} took {elapsed}", self.label);
        step(format_args!("done in {elapsed}"));
    }
}
