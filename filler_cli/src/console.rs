//! Terminal operator: startup prompts and the calibration dialogue.
//!
//! Startup answers are read on a dedicated thread, one line per shown prompt,
//! and delivered as `UiSignal`s. End of input closes the signal channel, which
//! the startup sequence treats as cancellation.

use std::io::{self, BufRead};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use filler_core::{
    CalibrationOperator, FillMode, FillerError, Prompt, StartupUi, StepName, UiSignal, UserAction,
};

fn fmt_weights(weights: &[f32]) -> String {
    if weights.is_empty() {
        return "(no active stations)".to_string();
    }
    weights
        .iter()
        .map(|w| format!("{w:.1} g"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn hint(step: StepName) -> &'static str {
    match step {
        StepName::StationVerification => "Enter=continue, t N=toggle station N, r=rescan, q=abort",
        StepName::FillingModeSelection => "auto | manual | smart, b=back, q=abort",
        _ => "Enter=continue, b=back, q=abort",
    }
}

/// Map one input line to the action it means at `step`.
pub fn parse_action(step: StepName, line: &str) -> Option<UserAction> {
    let t = line.trim().to_ascii_lowercase();
    match t.as_str() {
        "b" | "back" => return Some(UserAction::Back),
        "q" | "quit" | "abort" => return Some(UserAction::Abort),
        _ => {}
    }
    match step {
        StepName::StationVerification => match t.as_str() {
            "" | "n" | "next" => Some(UserAction::Next),
            "r" | "rescan" => Some(UserAction::Rescan),
            other => other
                .strip_prefix('t')
                .unwrap_or(other)
                .trim()
                .parse::<usize>()
                .ok()
                .map(UserAction::Toggle),
        },
        StepName::FillingModeSelection => {
            let mode = match t.as_str() {
                "a" => Some(FillMode::Auto),
                "m" => Some(FillMode::Manual),
                "s" => Some(FillMode::Smart),
                other => other.parse::<FillMode>().ok(),
            };
            mode.map(UserAction::SelectMode)
        }
        _ => matches!(t.as_str(), "" | "n" | "next" | "y" | "yes").then_some(UserAction::Next),
    }
}

pub struct ConsoleUi {
    prompts: Sender<StepName>,
}

impl ConsoleUi {
    /// Start the input thread; answers go to `signals`.
    pub fn spawn(signals: Sender<UiSignal>) -> Self {
        let (prompts, shown) = unbounded::<StepName>();
        thread::spawn(move || {
            let stdin = io::stdin();
            let mut lines = stdin.lock().lines();
            for step in shown.iter() {
                loop {
                    let Some(Ok(line)) = lines.next() else {
                        tracing::debug!("operator input closed");
                        return;
                    };
                    match parse_action(step, &line) {
                        Some(action) => {
                            if signals.send(UiSignal { step, action }).is_err() {
                                return;
                            }
                            break;
                        }
                        None => println!("  ? '{}' not understood ({})", line.trim(), hint(step)),
                    }
                }
            }
        });
        Self { prompts }
    }
}

impl StartupUi for ConsoleUi {
    fn show(&mut self, step: StepName, prompt: &Prompt) {
        println!();
        match prompt {
            Prompt::StationVerification { connected, enabled } => {
                println!("Station verification:");
                for (i, (c, e)) in connected.iter().zip(enabled).enumerate() {
                    let link = if *c { "connected" } else { "not found" };
                    let on = if *e { "enabled" } else { "disabled" };
                    println!("  [{i}] {link:<10} {on}");
                }
            }
            Prompt::ClearScales { weights } => {
                println!("Remove everything from the scales. Readings: {}", fmt_weights(weights));
            }
            Prompt::ConfirmScalesClear { weights, threshold_g } => {
                println!(
                    "A scale reads more than {threshold_g} g ({}). Tare anyway? (Enter=yes, b=no)",
                    fmt_weights(weights)
                );
            }
            Prompt::SelectFillMode => println!("Select filling mode."),
            Prompt::PlaceFullBottles { weights } => {
                println!(
                    "Place a full bottle on every active station. Readings: {}",
                    fmt_weights(weights)
                );
            }
            Prompt::EmptyBottle { bottle, range, weights } => {
                println!(
                    "Empty the '{bottle}' bottles and place them back (expected {range}). Readings: {}",
                    fmt_weights(weights)
                );
            }
        }
        println!("  {}", hint(step));
        if self.prompts.send(step).is_err() {
            tracing::warn!(%step, "operator input thread has stopped");
        }
    }

    fn notify(&mut self, step: StepName, error: &FillerError) {
        println!("  ! {step}: {error}");
    }
}

fn read_line() -> Option<String> {
    let mut s = String::new();
    match io::stdin().read_line(&mut s) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(s),
    }
}

fn is_abort(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "q" | "quit" | "abort")
}

/// Blocking calibration dialogue on stdin/stdout.
#[derive(Debug, Default)]
pub struct ConsoleOperator {
    /// Reference weight given on the command line; skips the question.
    reference_g: Option<f32>,
}

impl ConsoleOperator {
    pub fn new(reference_g: Option<f32>) -> Self {
        Self { reference_g }
    }
}

impl CalibrationOperator for ConsoleOperator {
    fn confirm_scale_empty(&mut self, station: usize) -> bool {
        println!("Station {station}: remove everything from the scale, then press Enter (q to abort)");
        read_line().is_some_and(|l| !is_abort(&l))
    }

    fn reference_weight(&mut self, station: usize, default_g: f32) -> Option<f32> {
        if let Some(g) = self.reference_g {
            println!("Station {station}: place the {g} g reference weight on the scale");
            return Some(g);
        }
        loop {
            println!("Station {station}: place the reference weight and enter its mass in grams [{default_g}]");
            let line = read_line()?;
            let t = line.trim();
            if t.is_empty() {
                return Some(default_g);
            }
            if is_abort(t) {
                return None;
            }
            match t.parse::<f32>() {
                Ok(g) if g.is_finite() && g > 0.0 => return Some(g),
                _ => println!("  ? '{t}' is not a positive number of grams"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StepName::StationVerification, "", Some(UserAction::Next))]
    #[case(StepName::StationVerification, "t 2", Some(UserAction::Toggle(2)))]
    #[case(StepName::StationVerification, "1", Some(UserAction::Toggle(1)))]
    #[case(StepName::StationVerification, "R", Some(UserAction::Rescan))]
    #[case(StepName::FillingModeSelection, "Smart", Some(UserAction::SelectMode(FillMode::Smart)))]
    #[case(StepName::FillingModeSelection, "m", Some(UserAction::SelectMode(FillMode::Manual)))]
    #[case(StepName::FillingModeSelection, "", None)]
    #[case(StepName::ClearAllScales, "yes", Some(UserAction::Next))]
    #[case(StepName::ClearAllScales, "b", Some(UserAction::Back))]
    #[case(StepName::EmptyBottleCheck, "q", Some(UserAction::Abort))]
    #[case(StepName::FullBottleCheck, "maybe", None)]
    fn input_lines_map_to_actions(
        #[case] step: StepName,
        #[case] line: &str,
        #[case] want: Option<UserAction>,
    ) {
        assert_eq!(parse_action(step, line), want);
    }
}
