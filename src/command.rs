/// Argument construction for the capture utility.
use crate::config::CaptureConfig;
use std::path::Path;

pub const DEFAULT_CAPTURE_BINARY: &str = "airodump-ng";

/// Build the full command line: binary first, then its arguments.
///
/// `<binary> <interface> -f <hop> -w <output_base> [--output-format a,b] [--band <band>] [--gpsd]`
pub fn build_command(binary: &str, config: &CaptureConfig, output_base: &Path) -> Vec<String> {
    let mut cmd = vec![
        binary.to_string(),
        config.interface.clone(),
        "-f".to_string(),
        config.channel_hop_time.to_string(),
        "-w".to_string(),
        output_base.to_string_lossy().into_owned(),
    ];

    if !config.output_formats.is_empty() {
        cmd.push("--output-format".to_string());
        cmd.push(config.output_formats.join(","));
    }

    if config.use_band && !config.band.is_empty() {
        cmd.push("--band".to_string());
        cmd.push(config.band.clone());
    }

    if config.use_gpsd {
        cmd.push("--gpsd".to_string());
    }

    cmd
}
