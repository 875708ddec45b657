//! UI utilities for BlueTransfer CLI.

use std::io::{self, Write};

use bluetransfer_core::file::format_size;
use bluetransfer_core::TransferSnapshot;

/// Render one progress line for a transfer.
pub fn progress_line(snapshot: &TransferSnapshot) -> String {
    let eta = snapshot
        .eta()
        .map_or_else(|| "--".to_string(), |d| format_eta(d.as_secs()));
    format!(
        "[{:>6.2}%] {} - {} of {} - {}/s - ETA: {} ({})",
        snapshot.percentage(),
        snapshot.file_name,
        format_size(snapshot.bytes_transferred),
        format_size(snapshot.file_size),
        format_size(snapshot.speed_bps),
        eta,
        snapshot.status
    )
}

/// Overwrite the current terminal line with `line`.
pub fn redraw(line: &str) {
    print!("\r  {}    ", line);
    let _ = io::stdout().flush();
}

/// Format seconds as "M:SS", or "H:MM:SS" past an hour.
pub fn format_eta(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

/// Ask a yes/no question on stdin. Empty input counts as yes.
pub fn confirm(prompt: &str) -> io::Result<bool> {
    print!("  {} [Y/n] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();
    Ok(input.is_empty() || input == "y" || input == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "0:00");
        assert_eq!(format_eta(65), "1:05");
        assert_eq!(format_eta(3599), "59:59");
        assert_eq!(format_eta(3661), "1:01:01");
    }
}
