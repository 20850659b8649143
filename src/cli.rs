//! # Command-Line Interface Module
//!
//! This module defines the command-line interface for Echoes using Clap derive
//! macros.
//!
//! ## Commands
//!
//! - `import`: Load tracks and raw analysis features from a JSON file
//! - `precompute`: Normalize all features and rebuild the similarity index
//! - `similar`: Expand the similarity graph around tracks and write a playlist
//! - `bulk`: Exhaustive all-pairs similarity into the database
//! - `groups`: Show stored similar tracks grouped by artist and album
//! - `weights`: Print the current feature weights
//!
//! ## Examples
//!
//! ```bash
//! echoes import analysis.json
//! echoes precompute
//! echoes similar "artist: miles davis and title: so what" --depth 2
//! echoes similar 42 --train
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "echoes")]
#[command(about = "Echoes: content-based music similarity and feedback-trained playlists")]
#[command(version)]
pub struct Args {
    /// Configuration file
    ///
    /// Created with defaults on first use. Defaults to the platform
    /// configuration directory (`~/.config/echoes/config.json` on Linux).
    #[arg(long, global = true, env = "ECHOES_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import tracks and raw features
    ///
    /// Reads a JSON array of objects with `track_id`, `title`, `artist`,
    /// `album`, `path`, optional `genre` and a `features` array in the
    /// configured feature order. Existing tracks are replaced.
    Import {
        /// JSON file produced by the analysis step
        #[arg(value_hint = clap::ValueHint::FilePath)]
        path: PathBuf,
    },

    /// Normalize features and rebuild the index
    ///
    /// Recomputes the per-feature minimum and maximum over the whole catalog,
    /// stores every track's normalized vector and rebuilds the similarity
    /// index with the current weights.
    Precompute,

    /// Find similar tracks and write a playlist
    ///
    /// QUERY is either a numeric track id or a search such as
    /// `artist: The Who and title: Generation` (fields: artist, album,
    /// title, genre; joined with `and` or `or`).
    Similar {
        /// Track id or search query
        #[arg(value_hint = clap::ValueHint::Other)]
        query: String,

        /// Neighbors per expanded track
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Expansion depth (1 = seeds and their direct neighbors)
        #[arg(short, long)]
        depth: Option<usize>,

        /// Playlist output path
        ///
        /// Defaults to `<temp_dir>/echoes_<id>.m3u` from the configuration.
        #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
        playlist: Option<PathBuf>,

        /// Also write the similarity graph as JSON
        #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
        graph: Option<PathBuf>,

        /// Rate the neighbors of the last seed and retrain the weights
        #[arg(short, long)]
        train: bool,
    },

    /// Compute exhaustive pairwise similarity
    ///
    /// Compares every track with every other one in parallel and stores the
    /// best pairs above the configured threshold. Slow on large catalogs.
    Bulk,

    /// Show similar tracks grouped by artist and album
    Groups {
        /// Minimum stored similarity
        #[arg(short, long, default_value = "0.8")]
        threshold: f64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the current feature weights
    Weights,

    /// Generate shell completions
    ///
    /// Usage: echoes completion bash > ~/.local/share/bash-completion/completions/echoes
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// List track titles and artists for completion (hidden command)
    #[command(hide = true)]
    CompleteTracks,
}
