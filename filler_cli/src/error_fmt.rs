//! Human-readable error descriptions and structured JSON error formatting.

use filler_core::{BuildError, FillerError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingMode => {
                "What happened: Startup finished without a filling mode.\nLikely causes: The mode selection step was skipped by a custom step list.\nHow to fix: Run the canonical startup sequence and pick auto, manual or smart.".to_string()
            }
            BuildError::MissingBottle => {
                "What happened: No bottle profile was matched for an automatic fill.\nLikely causes: The full bottle check did not run or matched nothing.\nHow to fix: Check the bottle_<id> entries in the settings file and rerun startup.".to_string()
            }
            BuildError::MissingTarget | BuildError::MissingTimeLimit => format!(
                "What happened: The selected bottle profile is incomplete ({be}).\nLikely causes: A bottle entry without target weight or time limit.\nHow to fix: Use the form bottle_<id>=<target_g>:<empty_min>-<empty_max>:<time_limit_ms>."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid fill parameters ({msg}).\nLikely causes: Zero or negative values in a bottle profile.\nHow to fix: Edit the settings file, then rerun startup."
            ),
        };
    }

    if let Some(fe) = err.downcast_ref::<FillerError>() {
        return match fe {
            FillerError::Cancelled => {
                "What happened: Operation cancelled.\nLikely causes: Ctrl-C or operator input closed.\nHow to fix: Start the command again when ready.".to_string()
            }
            FillerError::NoStationsEnabled => {
                "What happened: No station is both enabled and connected.\nLikely causes: Stations unplugged, not powered, or all toggled off.\nHow to fix: Check cables and power, rescan at station verification, or enable at least one station.".to_string()
            }
            FillerError::HandshakeTimeout | FillerError::Timeout => format!(
                "What happened: {fe}.\nLikely causes: Wrong baud rate, wrong handshake profile, or a busy device.\nHow to fix: Verify serial.baud and handshake.profile in the config; power-cycle the station."
            ),
            FillerError::LinkFailure(reason) => format!(
                "What happened: Serial link lost ({reason}).\nLikely causes: USB cable unplugged or the device reset.\nHow to fix: Reconnect the station and rescan."
            ),
            FillerError::RangeMismatch { expected, weights } => format!(
                "What happened: Scale readings {weights:?} are outside {expected}.\nLikely causes: Wrong bottles placed, or stale calibration.\nHow to fix: Place the right bottles, or recalibrate the stations that read off."
            ),
            FillerError::StepFailed { step, message } => format!(
                "What happened: Startup stopped at {step}: {message}.\nLikely causes: Operator abort or a station that stopped responding.\nHow to fix: Resolve the reported issue and run startup again."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("invalid configuration") || lower.contains("read config") {
        let detail = err
            .chain()
            .skip(1)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        return format!(
            "What happened: Configuration is invalid or unreadable ({detail}).\nLikely causes: Missing [[stations]], duplicate serial ids, or out-of-range values.\nHow to fix: Edit the TOML config and try again."
        );
    }

    if lower.contains("settings") {
        return format!(
            "What happened: The settings file could not be used ({msg}).\nLikely causes: A malformed key=value line or bottle entry.\nHow to fix: Run `filler self-check` and fix the reported line."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<BuildError>().is_some() {
        return "BuildError";
    }
    match err.downcast_ref::<FillerError>() {
        Some(FillerError::Cancelled) => "Cancelled",
        Some(FillerError::NoStationsEnabled) => "NoStationsEnabled",
        Some(FillerError::HandshakeTimeout) => "HandshakeTimeout",
        Some(FillerError::Timeout) => "Timeout",
        Some(FillerError::LinkFailure(_)) => "LinkFailure",
        Some(FillerError::StepFailed { .. }) => "StepFailed",
        Some(FillerError::RangeMismatch { .. }) => "RangeMismatch",
        Some(FillerError::State(_)) => "State",
        Some(FillerError::Config(_)) => "Config",
        Some(_) => "Protocol",
        None => "Error",
    }
}

/// Stable exit codes per failure class; anything unclassified returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match err.downcast_ref::<FillerError>() {
        Some(FillerError::Cancelled) => 130,
        Some(FillerError::NoStationsEnabled) => 3,
        Some(FillerError::HandshakeTimeout | FillerError::Timeout) => 4,
        Some(FillerError::LinkFailure(_)) => 5,
        Some(FillerError::StepFailed { .. }) => 6,
        Some(FillerError::RangeMismatch { .. }) => 7,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({ "reason": reason_name(err), "message": humanize(err) });
    if let Some(FillerError::StepFailed { step, .. }) = err.downcast_ref::<FillerError>() {
        obj["step"] = json!(step.as_str());
    }
    obj.to_string()
}
