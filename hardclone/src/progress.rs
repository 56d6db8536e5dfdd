//! Terminal progress reporting for controller operations.
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use hardclone_core::Error;
use hardclone_core::controller::{Observer, OperationState, Phase};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{prefix:12} [{elapsed_precise}] [{bar:40.COLOR/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const SPINNER_TEMPLATE: &str = "{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}";

/// Shows one progress bar per phase. Clones share the current bar, so the
/// caller can keep a handle to clear it after a failure.
#[derive(Clone)]
pub struct ProgressObserver {
    transfer_label: &'static str,
    assume_yes: bool,
    compressing: bool,
    current: Arc<Mutex<Option<ProgressBar>>>,
}

/// The question asked when the output filesystem looks too small.
fn space_prompt(compressing: bool) -> &'static str {
    if compressing {
        "Compression may still make it fit. Continue anyway?"
    } else {
        "The image may not fit. Continue anyway?"
    }
}

impl ProgressObserver {
    pub fn new(transfer_label: &'static str, assume_yes: bool) -> Self {
        Self {
            transfer_label,
            assume_yes,
            compressing: false,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Marks the output as compressed, which changes the low-space prompt.
    pub fn compressing(mut self, compressing: bool) -> Self {
        self.compressing = compressing;
        self
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.current.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }

    /// Removes a bar left running by a failed or cancelled phase.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.current.lock() {
            if let Some(bar) = guard.take() {
                bar.abandon_with_message(style("❌ Operation failed.").red().to_string());
            }
        }
    }

    fn describe(&self, phase: Phase) -> (&'static str, &'static str, &'static str) {
        match phase {
            Phase::Transfer => (self.transfer_label, "green", "Transfer complete."),
            Phase::Verify => ("Verifying", "magenta", "Verification successful."),
            Phase::Checksum => ("Checksums", "cyan", "Checksums written."),
        }
    }
}

impl Observer for ProgressObserver {
    fn on_state(&self, state: OperationState) {
        log::debug!("Now {state}");
    }

    fn on_phase_start(&self, phase: Phase, total: Option<u64>) {
        let (prefix, color, _) = self.describe(phase);
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                let template = BAR_TEMPLATE.replace("COLOR", color);
                bar.set_style(
                    ProgressStyle::with_template(&template)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("■ "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            }
        };
        bar.set_prefix(prefix);
        if let Ok(mut guard) = self.current.lock() {
            if let Some(previous) = guard.replace(bar) {
                previous.finish();
            }
        }
    }

    fn on_progress(&self, _phase: Phase, bytes: u64) {
        self.with_bar(|bar| bar.set_position(bytes));
    }

    fn on_phase_end(&self, phase: Phase) {
        let (_, _, message) = self.describe(phase);
        if let Ok(mut guard) = self.current.lock() {
            if let Some(bar) = guard.take() {
                bar.finish_with_message(message);
            }
        }
    }

    fn acknowledge(&self, warning: &Error) -> bool {
        println!("{} {warning}", style("WARNING:").yellow().bold());
        if self.assume_yes {
            return true;
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(space_prompt(self.compressing))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}
