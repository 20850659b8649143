//! # Shell Completion Module
//!
//! Generation of completion scripts through `clap_complete`, plus the list of
//! ready-made search queries (`title: ...`, `artist: ...`) served to shells by
//! the hidden `complete-tracks` command.
//!
//! ## Usage
//!
//! ```bash
//! # Generate bash completions
//! echoes completion bash > ~/.local/share/bash-completion/completions/echoes
//!
//! # Generate zsh completions
//! echoes completion zsh > ~/.config/zsh/completions/_echoes
//! ```

use crate::db::Database;
use anyhow::Result;
use clap::Command;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::collections::BTreeSet;
use std::io::{self, Write};

/// Generate shell completions for the given shell
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

/// Convert our Shell enum to clap_complete's Shell enum
#[must_use]
pub fn shell_to_completion_shell(shell: crate::cli::Shell) -> CompletionShell {
    match shell {
        crate::cli::Shell::Bash => CompletionShell::Bash,
        crate::cli::Shell::Zsh => CompletionShell::Zsh,
        crate::cli::Shell::Fish => CompletionShell::Fish,
        crate::cli::Shell::PowerShell => CompletionShell::PowerShell,
        crate::cli::Shell::Elvish => CompletionShell::Elvish,
    }
}

/// Search queries matching each catalogued title and artist, sorted and
/// without duplicates.
///
/// # Errors
///
/// Database failures.
pub fn track_completions(db: &Database) -> Result<Vec<String>> {
    let mut completions = BTreeSet::new();
    for track in db.all_tracks()? {
        if !track.title.is_empty() {
            completions.insert(format!("title: {}", track.title));
        }
        if !track.artist.is_empty() {
            completions.insert(format!("artist: {}", track.artist));
        }
    }
    Ok(completions.into_iter().collect())
}

/// Print one completion per line.
///
/// # Errors
///
/// Database or I/O failures.
pub fn print_track_completions(db: &Database, out: &mut impl Write) -> Result<()> {
    for completion in track_completions(db)? {
        writeln!(out, "{completion}")?;
    }
    Ok(())
}
