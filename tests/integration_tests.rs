//! # Integration Tests for Echoes
//!
//! End-to-end tests of the library pipeline (normalize, index, expand, train,
//! persist) and of the `echoes` binary driven through a temporary
//! configuration.

use anyhow::Result;
use echoes::config::{AppConfig, SimilarityConfig, TrainingConfig};
use echoes::db::{Database, ImportRecord};
use echoes::features::{FeatureSchema, TrackId};
use echoes::index::{build_from_store, rebuild_index, AnnIndex};
use echoes::similarity::SimilarityEngine;
use echoes::store::{FeatureStore, MemoryStore, TrackInfo};
use echoes::weights::{ConfigWeightStore, FeatureTable, WeightStore, WeightVector};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn schema() -> FeatureSchema {
    FeatureSchema::new(vec!["bpm".to_string(), "timbre".to_string()]).unwrap()
}

fn records() -> Vec<ImportRecord> {
    [
        (1, "Blue in Green", "Miles Davis", [60.0, 0.20]),
        (2, "So What", "Miles Davis", [68.0, 0.25]),
        (3, "Naima", "John Coltrane", [64.0, 0.30]),
        (4, "Baba O'Riley", "The Who", [118.0, 0.90]),
        (5, "My Generation", "The Who", [124.0, 0.95]),
    ]
    .into_iter()
    .map(|(id, title, artist, features): (TrackId, &str, &str, [f64; 2])| ImportRecord {
        track_id: id,
        title: title.to_string(),
        artist: artist.to_string(),
        album: format!("{artist} album"),
        genre: None,
        path: format!("/music/{id}.flac"),
        features: features.to_vec(),
    })
    .collect()
}

/// A configuration with two features and every artifact inside `dir`.
fn write_config(dir: &Path) -> Result<PathBuf> {
    let mut config = AppConfig::default_in(dir);
    config.features = FeatureTable::from_weights(&schema(), &WeightVector::uniform(2, 1.0))?;
    config.index.feature_dim = 2;
    config.index.num_trees = 4;
    config.training = TrainingConfig {
        candidates: 2,
        ..TrainingConfig::default()
    };

    let path = dir.join("config.json");
    config.save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;

    #[test]
    fn test_triangle_nearest_neighbor_is_never_self() -> Result<()> {
        let mut store = MemoryStore::new();
        store.insert_features(1, vec![0.0, 0.0]);
        store.insert_features(2, vec![1.0, 0.0]);
        store.insert_features(3, vec![0.0, 1.0]);

        let index = build_from_store(&store, &WeightVector::uniform(2, 1.0), 3)?;
        let result = index.query_by_item(1, 1)?;

        assert_eq!(result.len(), 1);
        assert!(result[0].id == 2 || result[0].id == 3);
        assert!((result[0].distance - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_database_to_playlist() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut db = Database::open(&temp_dir.path().join("music.db"))?;
        db.import(&records(), &schema())?;
        assert_eq!(db.precompute_features(&schema())?, 5);

        let weights = WeightVector::uniform(2, 1.0);
        let index_path = temp_dir.path().join("features.idx");
        rebuild_index(&db, &weights, 4, &index_path)?;
        let index = AnnIndex::load(&index_path, 2)?;
        assert!(AnnIndex::load(&index_path, 3).is_err());

        let engine = SimilarityEngine::new(
            index,
            weights,
            &db,
            SimilarityConfig {
                neighbors: 2,
                ..SimilarityConfig::default()
            },
        )?;
        let expansion = engine.expand(&[4])?;

        assert_eq!(expansion.playlist[0], "/music/4.flac");
        assert_eq!(expansion.playlist[1], "/music/5.flac");
        assert_eq!(expansion.playlist.len(), 3);

        let written = echoes::playlist::write_m3u(&temp_dir.path().join("mix.m3u"), &expansion.playlist)?;
        let text = std::fs::read_to_string(written)?;
        assert!(text.starts_with("#EXTM3U\n/music/4.flac\n/music/5.flac\n"));
        Ok(())
    }

    #[test]
    fn test_search_seeds_that_neighbor_each_other() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut db = Database::open(&temp_dir.path().join("music.db"))?;
        db.import(&records(), &schema())?;
        db.precompute_features(&schema())?;

        let weights = WeightVector::uniform(2, 1.0);
        let index = build_from_store(&db, &weights, 4)?;
        let seeds: Vec<TrackId> = db.search_tracks("artist: the who")?.iter().map(|t| t.id).collect();
        assert_eq!(seeds, vec![4, 5]);

        let engine = SimilarityEngine::new(
            index,
            weights,
            &db,
            SimilarityConfig {
                neighbors: 1,
                max_depth: 2,
                ..SimilarityConfig::default()
            },
        )?;
        let expansion = engine.expand(&seeds)?;

        assert_eq!(
            expansion.playlist,
            vec!["/music/4.flac", "/music/5.flac", "/music/5.flac", "/music/4.flac"]
        );
        assert!(seeds.iter().all(|&id| expansion.graph.node(id).is_some_and(|n| n.seed)));
        Ok(())
    }

    #[test]
    fn test_feature_weights_reshape_neighbors() -> Result<()> {
        // Track 2 is close in the first feature, track 3 in the second.
        let raw = BTreeMap::from([
            (1, vec![0.0, 0.0]),
            (2, vec![0.1, 1.0]),
            (3, vec![1.0, 0.1]),
        ]);
        let store = MemoryStore::from_raw(&raw)?;

        let first_only = WeightVector::new(vec![1.0, 0.0]);
        let index = build_from_store(&store, &first_only, 2)?;
        assert_eq!(index.query_by_item(1, 1)?[0].id, 2);

        let second_only = WeightVector::new(vec![0.0, 1.0]);
        let index = build_from_store(&store, &second_only, 2)?;
        assert_eq!(index.query_by_item(1, 1)?[0].id, 3);
        Ok(())
    }

    #[test]
    fn test_trained_weights_persist_and_rebuild() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = write_config(temp_dir.path())?;
        let config = AppConfig::load(&config_path)?;

        let mut store = MemoryStore::new();
        for record in records() {
            store.insert_features(record.track_id, record.features.iter().map(|f| f / 200.0).collect::<Vec<_>>());
            store.insert_track(TrackInfo {
                id: record.track_id,
                title: record.title,
                artist: record.artist,
                album: record.album,
                path: record.path,
            });
        }

        let weight_store = ConfigWeightStore::new(&config_path, schema());
        let trained = WeightVector::new(vec![1.75, 0.25]);
        let index = echoes::feedback::apply_trained_weights(
            &weight_store,
            &store,
            &trained,
            config.index.num_trees,
            &config.index.path,
        )?;

        assert_eq!(weight_store.load()?, trained);
        assert_eq!(index.len(), store.track_ids()?.len());
        let reloaded = AnnIndex::load(&config.index.path, 2)?;
        let point = reloaded.point(1).unwrap();
        assert!((point[0] - 1.75 * 60.0 / 200.0).abs() < 1e-12);
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn echoes(config: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_echoes"))
            .arg("--config")
            .arg(config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to run echoes")
    }

    fn prepared() -> Result<(TempDir, PathBuf)> {
        let temp_dir = TempDir::new()?;
        let config = write_config(temp_dir.path())?;
        let import = temp_dir.path().join("analysis.json");
        std::fs::write(&import, serde_json::to_string(&records())?)?;

        let out = echoes(&config, &["import", import.to_str().unwrap()]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let out = echoes(&config, &["precompute"]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

        Ok((temp_dir, config))
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = Command::new(env!("CARGO_BIN_EXE_echoes"))
            .arg("--help")
            .output()
            .expect("Failed to run help command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("echoes"));
        assert!(stdout.contains("similar"));
        assert!(stdout.contains("precompute"));
    }

    #[test]
    fn test_completion_generation() {
        let output = Command::new(env!("CARGO_BIN_EXE_echoes"))
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");

        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("echoes"));
    }

    #[test]
    fn test_similar_writes_playlist_and_graph() -> Result<()> {
        let (temp_dir, config) = prepared()?;
        let playlist = temp_dir.path().join("out.m3u");
        let graph = temp_dir.path().join("graph.json");

        let out = echoes(
            &config,
            &[
                "similar",
                "artist: the who and title: baba",
                "-n",
                "2",
                "--playlist",
                playlist.to_str().unwrap(),
                "--graph",
                graph.to_str().unwrap(),
            ],
        );
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

        let text = std::fs::read_to_string(&playlist)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "/music/4.flac");
        assert_eq!(lines[2], "/music/5.flac");

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&graph)?)?;
        assert!(json["edges"].as_array().is_some_and(|e| e.len() >= 2));
        Ok(())
    }

    #[test]
    fn test_similar_without_match_fails() -> Result<()> {
        let (_temp_dir, config) = prepared()?;
        let out = echoes(&config, &["similar", "artist: nobody"]);
        assert!(!out.status.success());
        Ok(())
    }

    #[test]
    fn test_feedback_training_updates_weights() -> Result<()> {
        let (_temp_dir, config) = prepared()?;

        let mut child = Command::new(env!("CARGO_BIN_EXE_echoes"))
            .arg("--config")
            .arg(&config)
            .args(["similar", "1", "--train"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("stdin is piped")
            .write_all(b"5\n1\ny\n")?;
        let out = child.wait_with_output()?;
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        assert!(String::from_utf8_lossy(&out.stdout).contains("Weights saved"));

        let weights = ConfigWeightStore::new(&config, schema()).load()?;
        assert_ne!(weights, WeightVector::uniform(2, 1.0));
        assert!(weights.as_slice().iter().all(|w| (0.0..=2.0).contains(w)));
        Ok(())
    }

    #[test]
    fn test_quitting_feedback_keeps_weights() -> Result<()> {
        let (_temp_dir, config) = prepared()?;

        let mut child = Command::new(env!("CARGO_BIN_EXE_echoes"))
            .arg("--config")
            .arg(&config)
            .args(["similar", "1", "--train"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        child.stdin.take().expect("stdin is piped").write_all(b"3\nq\n")?;
        let out = child.wait_with_output()?;

        assert!(out.status.success());
        assert!(String::from_utf8_lossy(&out.stdout).contains("aborted"));
        let weights = ConfigWeightStore::new(&config, schema()).load()?;
        assert_eq!(weights, WeightVector::uniform(2, 1.0));
        Ok(())
    }

    #[test]
    fn test_bulk_and_groups() -> Result<()> {
        let (_temp_dir, config) = prepared()?;

        let out = echoes(&config, &["bulk"]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

        let out = echoes(&config, &["groups", "--threshold", "0.9", "--json"]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let groups: serde_json::Value = serde_json::from_slice(&out.stdout)?;
        assert!(groups["by_artist"].is_object());
        Ok(())
    }

    #[test]
    fn test_weights_lists_every_feature() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = write_config(temp_dir.path())?;

        let out = echoes(&config, &["weights"]);
        assert!(out.status.success());
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("bpm"));
        assert!(stdout.contains("timbre"));
        Ok(())
    }
}
