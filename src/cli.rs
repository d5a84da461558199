//! Command-line surface (clap derive): torrent/magnet source, download
//! directory, listen port, rate limits, log level.
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "rstc", version, about = "A BitTorrent client core")]
pub struct Cli {
    /// Path to a `.torrent` file, or a `magnet:?...` URI.
    pub source: String,

    /// Directory downloaded files materialize under. Defaults to `./downloads`.
    #[arg(short = 'd', long = "download-dir")]
    pub download_dir: Option<PathBuf>,

    /// TCP port to listen for incoming peer connections on.
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,

    /// Maximum download rate in bytes/second, 0 = unlimited.
    #[arg(long)]
    pub max_download_rate: Option<u64>,

    /// Maximum upload rate in bytes/second, 0 = unlimited.
    #[arg(long)]
    pub max_upload_rate: Option<u64>,

    /// Tracing filter directive, e.g. "info" or "rstc=debug".
    #[arg(long)]
    pub log_level: Option<String>,

    /// Force sequential (in-order) piece selection instead of rarest-first.
    #[arg(long)]
    pub sequential: bool,

    /// Disable DHT peer discovery.
    #[arg(long)]
    pub no_dht: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["rstc", "ubuntu.torrent"]);
        assert_eq!(cli.source, "ubuntu.torrent");
        assert!(cli.download_dir.is_none());
        assert!(!cli.sequential);
    }

    #[test]
    fn parses_all_flags() {
        let cli = Cli::parse_from([
            "rstc",
            "magnet:?xt=urn:btih:0102030405060708090a0b0c0d0e0f1011121314",
            "--download-dir",
            "/tmp/out",
            "--listen-port",
            "7000",
            "--max-download-rate",
            "1000000",
            "--max-upload-rate",
            "500000",
            "--log-level",
            "debug",
            "--sequential",
            "--no-dht",
        ]);
        assert_eq!(cli.download_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(cli.listen_port, Some(7000));
        assert_eq!(cli.max_download_rate, Some(1_000_000));
        assert!(cli.sequential);
        assert!(cli.no_dht);
    }
}
