//! # Echoes - Content-Based Music Similarity
//!
//! Echoes finds tracks that sound alike from their analysed audio features,
//! builds playlists around them, and learns from your ratings which features
//! matter to you.
//!
//! ## Usage
//!
//! ```bash
//! # Load analysis output and prepare the index
//! echoes import analysis.json
//! echoes precompute
//!
//! # Playlist of tracks similar to a search result
//! echoes similar "artist: nina simone" --depth 2
//!
//! # Rate the neighbors of track 42 and retrain the weights
//! echoes similar 42 --train
//! ```

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use echoes::bulk::{compute_all_pairs, AtomicProgress};
use echoes::cli::{self, Command};
use echoes::completion;
use echoes::config::{self, AppConfig};
use echoes::db::{Database, ImportRecord};
use echoes::features::TrackId;
use echoes::feedback::{apply_trained_weights, FeedbackSession, SessionOutcome, TerminalFeedback};
use echoes::index::{rebuild_index, AnnIndex};
use echoes::playlist::write_m3u;
use echoes::similarity::{EdgeKind, SimilarityEngine};
use echoes::store::{TrackCatalog, TrackInfo};
use echoes::trainer::{CancelToken, LogProgress, ProgressEvent, ProgressSink, Trainer};
use echoes::weights::{ConfigWeightStore, WeightStore};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Main entry point for the Echoes application.
///
/// Initializes logging, parses command-line arguments, and routes commands
/// to the library. Logging is controlled via `RUST_LOG`:
/// - `RUST_LOG=debug echoes similar 42` - Enable debug logging
/// - `RUST_LOG=echoes::trainer=debug echoes similar 42 --train` - Per-epoch loss
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    if let Command::Completion { shell } = args.command {
        let mut cmd = cli::Args::command();
        completion::generate_completions(completion::shell_to_completion_shell(shell), &mut cmd);
        return Ok(());
    }

    let config_path = match args.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    debug!("Using configuration {}", config_path.display());

    if let Command::CompleteTracks = args.command {
        // Completion must stay silent; never create files from here.
        if let Ok(config) = AppConfig::load(&config_path) {
            if config.database.path.exists() {
                let db = Database::open(&config.database.path)?;
                completion::print_track_completions(&db, &mut io::stdout().lock())?;
            }
        }
        return Ok(());
    }

    let config = AppConfig::load_or_init(&config_path)?;

    match args.command {
        Command::Import { path } => import(&config, &path),
        Command::Precompute => precompute(&config),
        Command::Similar {
            query,
            count,
            depth,
            playlist,
            graph,
            train,
        } => similar(
            &config,
            &config_path,
            &query,
            SimilarOptions {
                count,
                depth,
                playlist,
                graph,
                train,
            },
        ),
        Command::Bulk => bulk(&config),
        Command::Groups { threshold, json } => groups(&config, threshold, json),
        Command::Weights => weights(&config, &config_path),
        Command::Completion { .. } | Command::CompleteTracks => Ok(()),
    }
}

fn import(config: &AppConfig, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file {}", path.display()))?;
    let records: Vec<ImportRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("Error decoding '{}'", path.display()))?;

    let mut db = Database::open(&config.database.path)?;
    let count = db.import(&records, &config.schema()?)?;
    println!("Imported {count} tracks. Run `echoes precompute` to update the index.");
    Ok(())
}

fn precompute(config: &AppConfig) -> Result<()> {
    let schema = config.schema()?;
    let weights = config.features.weights(&schema)?;

    let mut db = Database::open(&config.database.path)?;
    let count = db.precompute_features(&schema)?;
    info!("Rebuilding index with {} trees", config.index.num_trees);
    let index = rebuild_index(&db, &weights, config.index.num_trees, &config.index.path)?;

    println!(
        "Normalized {count} tracks; index with {} tracks written to {}",
        index.len(),
        config.index.path.display()
    );
    Ok(())
}

struct SimilarOptions {
    count: Option<usize>,
    depth: Option<usize>,
    playlist: Option<PathBuf>,
    graph: Option<PathBuf>,
    train: bool,
}

/// A numeric query is a track id; anything else is a search.
fn resolve_seeds(db: &Database, query: &str) -> Result<Vec<TrackId>> {
    if let Ok(id) = query.trim().parse::<TrackId>() {
        return Ok(vec![id]);
    }
    let seeds: Vec<TrackId> = db.search_tracks(query)?.iter().map(|t| t.id).collect();
    if seeds.is_empty() {
        bail!("No tracks match `{query}`");
    }
    Ok(seeds)
}

fn similar(config: &AppConfig, config_path: &Path, query: &str, options: SimilarOptions) -> Result<()> {
    let schema = config.schema()?;
    let weight_store = ConfigWeightStore::new(config_path, schema);
    let weights = weight_store.load()?;

    let db = Database::open(&config.database.path)?;
    let seeds = resolve_seeds(&db, query)?;
    info!("Expanding {} seed tracks", seeds.len());

    let index = AnnIndex::load(&config.index.path, config.index.feature_dim)
        .context("Run `echoes precompute` to build the index")?;

    let mut similarity = config.similarity.clone();
    if let Some(count) = options.count {
        similarity.neighbors = count;
    }
    if let Some(depth) = options.depth {
        similarity.max_depth = depth;
    }
    let engine = SimilarityEngine::new(index, weights, &db, similarity)?;
    let expansion = engine.expand(&seeds)?;

    for &seed in &seeds {
        let Some(node) = expansion.graph.node(seed) else {
            continue;
        };
        println!("Similar to {}:", describe(node.track.as_ref(), seed));
        for edge in expansion
            .graph
            .edges_of_kind(EdgeKind::Traversal)
            .filter(|e| e.from == seed && e.depth == 0)
        {
            let track = db.track(edge.to)?;
            println!(
                "  {:>7.3}  {}",
                edge.similarity,
                describe(track.as_ref(), edge.to)
            );
        }
    }

    if !expansion.playlist.is_empty() {
        let path = options.playlist.unwrap_or_else(|| {
            config
                .temp_dir
                .join(format!("echoes_{}.m3u", seeds.first().copied().unwrap_or_default()))
        });
        let written = write_m3u(&path, &expansion.playlist)?;
        println!("Playlist written to {}", written.display());
    }

    if let Some(path) = options.graph {
        config::write_atomic(&path, expansion.graph.to_json()?.as_bytes())?;
        println!(
            "Graph with {} nodes and {} edges written to {}",
            expansion.graph.nodes().len(),
            expansion.graph.edges().len(),
            path.display()
        );
    }

    if options.train {
        let Some(&origin) = seeds.last() else {
            return Ok(());
        };
        train(config, &weight_store, &engine, origin)?;
    }

    Ok(())
}

fn describe(track: Option<&TrackInfo>, id: TrackId) -> String {
    match track {
        Some(t) => format!("{} - {}", t.title, t.artist),
        None => format!("track {id}"),
    }
}

fn train(
    config: &AppConfig,
    weight_store: &ConfigWeightStore,
    engine: &SimilarityEngine<'_, Database>,
    origin: TrackId,
) -> Result<()> {
    let Some(neighbors) = engine.similar_to(origin, config.training.candidates)? else {
        bail!("Track {origin} has no features; run `echoes precompute` first");
    };

    let mut ui = TerminalFeedback::new(io::stdin().lock(), io::stdout())
        .with_feature_names(weight_store.schema().names().to_vec());
    let mut session = FeedbackSession::new(engine.store(), &mut ui, Trainer::new(config.training.clone()));
    let Some(rated) = session.collect(origin, &neighbors)? else {
        println!("Feedback aborted; weights unchanged.");
        return Ok(());
    };

    // Ctrl-C only cancels once the ratings are in.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("Failed to install Ctrl-C handler")?;

    let mut progress = |event: &ProgressEvent| {
        LogProgress.on_epoch(event);
        if event.epoch % 10 == 0 {
            println!("Epoch {:>4}: loss {:.6}", event.epoch, event.loss);
        }
    };

    match session.train(&rated, engine.weights(), &mut progress, &cancel)? {
        SessionOutcome::Aborted => println!("Feedback aborted; weights unchanged."),
        SessionOutcome::Cancelled => println!("Training cancelled; weights unchanged."),
        SessionOutcome::Trained {
            confirmed: false, ..
        } => println!("New weights discarded."),
        SessionOutcome::Trained { weights, .. } => {
            let index = apply_trained_weights(
                weight_store,
                engine.store(),
                &weights.weights,
                config.index.num_trees,
                &config.index.path,
            )?;
            println!("Weights saved; index rebuilt over {} tracks.", index.len());
        }
    }
    Ok(())
}

fn bulk(config: &AppConfig) -> Result<()> {
    let mut db = Database::open(&config.database.path)?;
    let tracks = db.all_normalized_features()?;
    let progress = AtomicProgress::new();

    let pairs = compute_all_pairs(&tracks, &config.bulk, &progress)?;
    db.replace_similarities(&pairs)?;

    println!(
        "Stored {} similar pairs from {} tracks ({} batches)",
        pairs.len(),
        tracks.len(),
        progress.completed()
    );
    Ok(())
}

fn groups(config: &AppConfig, threshold: f64, json: bool) -> Result<()> {
    let db = Database::open(&config.database.path)?;
    let groups = db.group_similar_tracks(threshold)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    for (heading, grouped) in [("Artist", &groups.by_artist), ("Album", &groups.by_album)] {
        for (name, entries) in grouped {
            println!("{heading}: {name}");
            for e in entries {
                println!(
                    "  {:.3}  {} ~ {} ({} / {})",
                    e.similarity, e.track_title, e.similar_track_title, e.similar_artist, e.similar_album
                );
            }
        }
    }
    Ok(())
}

fn weights(config: &AppConfig, config_path: &Path) -> Result<()> {
    let store = ConfigWeightStore::new(config_path, config.schema()?);
    let weights = store.load()?;
    for (name, weight) in store.schema().names().iter().zip(weights.as_slice()) {
        println!("{name:<24} {weight:.4}");
    }
    Ok(())
}
