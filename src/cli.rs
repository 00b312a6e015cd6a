use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Live-reload file synchronization between a development machine and a
/// running remote process.
///
/// A monitor watches named directories and pushes every file change to a
/// server, which mirrors them into its own directories and asks the hosting
/// process to reload.
#[derive(Parser, Debug)]
#[command(name = "scenesync", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch tracked directories and push changes to a server.
    ///
    /// Also reads commands from stdin: `track <id> <path>`, `untrack <id>`,
    /// `tracked`, `help`, `quit`.
    Monitor {
        /// Server address to push changes to (falls back to scenesync.toml).
        host: Option<String>,

        /// Server port (falls back to scenesync.toml).
        port: Option<u16>,

        /// Track a directory under a name, as `id=path`. Repeatable. The id
        /// maps the directory to its counterpart on the server. Defaults to
        /// tracking the current directory as `current-directory`.
        #[arg(long = "track", value_name = "ID=PATH", value_parser = parse_id_path)]
        track: Vec<(String, PathBuf)>,

        /// Push every currently-tracked file once after each (re)connect,
        /// so the server starts from a complete copy.
        #[arg(long)]
        sync: bool,
    },

    /// Accept a monitor connection and apply pushed changes locally.
    Serve {
        /// Port to listen on (falls back to scenesync.toml).
        port: Option<u16>,

        /// Map an incoming id to a local directory, as `id=path`.
        /// Repeatable. Defaults to mapping `current-directory` to the
        /// current directory.
        #[arg(long = "map", value_name = "ID=PATH", value_parser = parse_id_path)]
        map: Vec<(String, PathBuf)>,

        /// Shell command to run after a batch of changes has been applied.
        #[arg(long, value_name = "CMD")]
        on_reload: Option<String>,
    },
}

/// Parse an `id=path` pair. The id must be non-empty and `=`-free; the path
/// may contain `=`.
fn parse_id_path(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((id.to_owned(), PathBuf::from(path)))
        }
        _ => Err(format!("expected ID=PATH, got '{s}'")),
    }
}
