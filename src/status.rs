//! Single-line progress display and final shutdown summary.
use rs_torrent_client::ratelimit::SpeedTracker;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Downloading,
    Endgame,
    Seeding,
}

impl Mode {
    fn tag(&self) -> &'static str {
        match self {
            Mode::Downloading => "[DOWNLOADING]",
            Mode::Endgame => "[ENDGAME]",
            Mode::Seeding => "[SEEDING]",
        }
    }
}

pub struct StatusLine {
    pub percent_complete: f64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub connected_peers: usize,
    pub mode: Mode,
}

impl StatusLine {
    pub fn render(&self) -> String {
        format!(
            "{:5.1}%  down {:>9}  up {:>9}  peers {:>3}  {}",
            self.percent_complete,
            format_rate(self.download_speed),
            format_rate(self.upload_speed),
            self.connected_peers,
            self.mode.tag(),
        )
    }

    /// Writes the line to `out`, overwriting the previous one via a carriage
    /// return (no trailing newline).
    pub fn print_inline<W: Write>(&self, out: &mut W) {
        let _ = write!(out, "\r{}", self.render());
        let _ = out.flush();
    }
}

fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

pub struct ShutdownSummary {
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub elapsed: std::time::Duration,
    pub completed: bool,
}

impl ShutdownSummary {
    pub fn render(&self) -> String {
        format!(
            "{} after {:.0}s — downloaded {}, uploaded {}",
            if self.completed { "download complete" } else { "stopped" },
            self.elapsed.as_secs_f64(),
            format_bytes(self.total_downloaded),
            format_bytes(self.total_uploaded),
        )
    }
}

fn format_bytes(bytes: u64) -> String {
    format_rate(bytes as f64).replace("/s", "")
}

/// Derives download/upload speed from the pair of sliding-window trackers
/// kept by the session.
pub fn current_rates(download: &mut SpeedTracker, upload: &mut SpeedTracker) -> (f64, f64) {
    (download.current_speed(), upload.current_speed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_percent_speeds_peers_and_mode_tag() {
        let line = StatusLine {
            percent_complete: 42.5,
            download_speed: 1536.0,
            upload_speed: 0.0,
            connected_peers: 7,
            mode: Mode::Endgame,
        };
        let rendered = line.render();
        assert!(rendered.contains("42.5%"));
        assert!(rendered.contains("1.5KB/s"));
        assert!(rendered.contains("peers   7"));
        assert!(rendered.contains("[ENDGAME]"));
    }

    #[test]
    fn shutdown_summary_reports_completion_state() {
        let summary = ShutdownSummary {
            total_downloaded: 1024 * 1024,
            total_uploaded: 0,
            elapsed: std::time::Duration::from_secs(120),
            completed: true,
        };
        let rendered = summary.render();
        assert!(rendered.starts_with("download complete"));
        assert!(rendered.contains("120s"));
    }
}
