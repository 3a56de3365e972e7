// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model artifact resolution.
//!
//! A model identifier is either a local directory holding a checkpoint
//! snapshot or a `HuggingFace` Hub repository id.  Hub files are fetched
//! with the blocking [`hf_hub`] client, which honours `HF_HOME` and
//! `HF_ENDPOINT` and caches under `~/.cache/huggingface/hub/`, so a second
//! run does not touch the network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;

use crate::config::TokenIds;
use crate::error::{ProbeError, Result};

/// Single-file checkpoint name.
const SINGLE_WEIGHTS: &str = "model.safetensors";
/// Sharded checkpoint index name.
const SHARD_INDEX: &str = "model.safetensors.index.json";

// ---------------------------------------------------------------------------
// ModelFiles
// ---------------------------------------------------------------------------

/// Local paths of every artifact a model needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// `tokenizer_config.json`, carrying the chat template when present.
    pub tokenizer_config: Option<PathBuf>,
    /// `generation_config.json`.
    pub generation_config: Option<PathBuf>,
    /// Safetensors weights: one file, or every shard in name order.
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve `model_id` to local files, downloading from the Hub when it
    /// is not an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Download`] if a required file is missing
    /// locally or cannot be fetched, and [`ProbeError::Config`] if a shard
    /// index cannot be parsed.
    pub fn resolve(model_id: &str) -> Result<Self> {
        let dir = Path::new(model_id);
        if dir.is_dir() {
            tracing::debug!(path = %dir.display(), "resolving model from local directory");
            return Self::resolve_from(&LocalDir(dir.to_path_buf()));
        }

        tracing::info!(model = model_id, "resolving model from the HuggingFace Hub");
        let token = std::env::var("HF_TOKEN")
            .ok()
            .or_else(|| std::env::var("HUGGINGFACE_HUB_TOKEN").ok());
        let api = ApiBuilder::from_env()
            .with_token(token)
            .build()
            .map_err(|e| ProbeError::Download(format!("hub client: {e}")))?;
        let repo = api.repo(Repo::new(model_id.to_owned(), RepoType::Model));
        Self::resolve_from(&HubRepo {
            repo,
            id: model_id.to_owned(),
        })
    }

    /// Resolve every artifact through `source`.
    fn resolve_from(source: &dyn FileSource) -> Result<Self> {
        let config = source.fetch("config.json")?;
        let tokenizer = source.fetch("tokenizer.json")?;
        let tokenizer_config = source.fetch_optional("tokenizer_config.json");
        let generation_config = source.fetch_optional("generation_config.json");
        let weights = resolve_weights(source)?;

        tracing::debug!(shards = weights.len(), "resolved safetensors weights");
        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            generation_config,
            weights,
        })
    }
}

// ---------------------------------------------------------------------------
// File sources
// ---------------------------------------------------------------------------

/// Somewhere checkpoint files can be fetched from.
trait FileSource {
    /// Local path of `name`, fetching it if needed.
    fn fetch(&self, name: &str) -> Result<PathBuf>;

    /// Like [`fetch`](Self::fetch), but absence is not an error.
    fn fetch_optional(&self, name: &str) -> Option<PathBuf> {
        match self.fetch(name) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(file = name, error = %e, "optional file unavailable");
                None
            }
        }
    }
}

/// A snapshot directory on disk.
struct LocalDir(PathBuf);

impl FileSource for LocalDir {
    fn fetch(&self, name: &str) -> Result<PathBuf> {
        let path = self.0.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ProbeError::Download(format!(
                "{name} not found in {}",
                self.0.display()
            )))
        }
    }
}

/// A Hub repository.
struct HubRepo {
    /// Blocking API handle.
    repo: ApiRepo,
    /// Repository id, for error messages.
    id: String,
}

impl FileSource for HubRepo {
    fn fetch(&self, name: &str) -> Result<PathBuf> {
        self.repo
            .get(name)
            .map_err(|e| ProbeError::Download(format!("{}/{name}: {e}", self.id)))
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Index structure for sharded safetensors models.
#[derive(Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: HashMap<String, String>,
}

/// Try the shard index first, then the single-file checkpoint.
fn resolve_weights(source: &dyn FileSource) -> Result<Vec<PathBuf>> {
    if let Some(index_path) = source.fetch_optional(SHARD_INDEX) {
        let index_str = std::fs::read_to_string(&index_path)?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)
            .map_err(|e| ProbeError::Config(format!("parse {SHARD_INDEX}: {e}")))?;
        return shard_paths(source, &index);
    }

    source
        .fetch(SINGLE_WEIGHTS)
        .map(|path| vec![path])
        .map_err(|e| {
            ProbeError::Download(format!(
                "no {SINGLE_WEIGHTS} or {SHARD_INDEX} available: {e}"
            ))
        })
}

/// Fetch each distinct shard named by `index`, in name order.
fn shard_paths(source: &dyn FileSource, index: &SafetensorsIndex) -> Result<Vec<PathBuf>> {
    let mut shard_names: Vec<&str> = index.weight_map.values().map(String::as_str).collect();
    shard_names.sort_unstable();
    shard_names.dedup();
    shard_names.into_iter().map(|name| source.fetch(name)).collect()
}

// ---------------------------------------------------------------------------
// GenerationConfig
// ---------------------------------------------------------------------------

/// The parts of `generation_config.json` that affect decoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    /// End-of-sequence ids, replacing those in `config.json` when present.
    #[serde(default, rename = "eos_token_id")]
    eos_token_id: Option<TokenIds>,
    /// Whether the checkpoint author intended sampling.
    #[serde(default)]
    pub do_sample: Option<bool>,
    /// Suggested sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Suggested nucleus threshold.
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Suggested top-k filter.
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl GenerationConfig {
    /// Parse a `generation_config.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if the file cannot be read and
    /// [`ProbeError::Config`] if it is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse `generation_config.json` content.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Config`] if `json` is malformed.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ProbeError::Config(format!("parse generation_config.json: {e}")))
    }

    /// End-of-sequence ids declared here (empty if none).
    #[must_use]
    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .clone()
            .map(TokenIds::into_vec)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn local_single_file_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        let weights = touch(dir.path(), "model.safetensors", "");

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.weights, vec![weights]);
        assert!(files.tokenizer_config.is_none());
        assert!(files.generation_config.is_none());
    }

    #[test]
    fn local_sharded_checkpoint_orders_and_dedups_shards() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");
        touch(dir.path(), "tokenizer_config.json", "{}");
        let a = touch(dir.path(), "model-00001-of-00002.safetensors", "");
        let b = touch(dir.path(), "model-00002-of-00002.safetensors", "");
        touch(
            dir.path(),
            SHARD_INDEX,
            r#"{"weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors"
            }}"#,
        );

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.weights, vec![a, b]);
        assert!(files.tokenizer_config.is_some());
    }

    #[test]
    fn local_missing_tokenizer_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "model.safetensors", "");

        let err = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ProbeError::Download(_)));
        assert!(err.to_string().contains("tokenizer.json"));
    }

    #[test]
    fn local_missing_weights_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json", "{}");
        touch(dir.path(), "tokenizer.json", "{}");

        let err = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ProbeError::Download(_)));
    }

    #[test]
    fn generation_config_eos_list_and_sampling() {
        let gen_config = GenerationConfig::from_json_str(
            r#"{"bos_token_id": 128000, "eos_token_id": [128001, 128008, 128009],
                "do_sample": true, "temperature": 0.6, "top_p": 0.9}"#,
        )
        .unwrap();
        assert_eq!(gen_config.eos_token_ids(), vec![128_001, 128_008, 128_009]);
        assert_eq!(gen_config.do_sample, Some(true));
        assert_eq!(gen_config.temperature, Some(0.6));
        assert_eq!(gen_config.top_p, Some(0.9));
        assert_eq!(gen_config.top_k, None);
    }

    #[test]
    fn generation_config_single_eos() {
        let gen_config = GenerationConfig::from_json_str(r#"{"eos_token_id": 151643}"#).unwrap();
        assert_eq!(gen_config.eos_token_ids(), vec![151_643]);
        assert_eq!(gen_config.do_sample, None);
    }
}
