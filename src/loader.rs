//! Locating diffusers-layout model weights
//!
//! A model is a directory with `unet/`, `vae/`, `text_encoder/` and
//! optionally `tokenizer/` sub-folders. When no local directory is given
//! (or it does not exist) the same files are fetched from the Hugging Face
//! Hub. Half precision variants (`*.fp16.safetensors`) are preferred when
//! requested and present.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::unet3d::UNet3DConfig;

/// Repository providing `tokenizer.json` for CLIP BPE tokenization
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Default Stable Diffusion checkpoint
pub const SD_REPO: &str = "stabilityai/stable-diffusion-2-1";

/// Default text-to-video checkpoint
pub const T2V_REPO: &str = "damo-vilab/text-to-video-ms-1.7b";

/// Weight files of one diffusion model
#[derive(Debug, Clone)]
pub struct ComponentFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub tokenizer: PathBuf,
    /// `unet/config.json` when available
    pub unet_config: Option<PathBuf>,
    /// Whether the UNet weights are the fp16 variant
    pub is_fp16: bool,
}

/// (sub-folder, stem) of every safetensors component
const UNET: (&str, &str) = ("unet", "diffusion_pytorch_model");
const VAE: (&str, &str) = ("vae", "diffusion_pytorch_model");
const TEXT_ENCODER: (&str, &str) = ("text_encoder", "model");

fn component_file((folder, stem): (&str, &str), fp16: bool) -> String {
    if fp16 {
        format!("{folder}/{stem}.fp16.safetensors")
    } else {
        format!("{folder}/{stem}.safetensors")
    }
}

impl ComponentFiles {
    /// Use `model_dir` when it exists, otherwise download `repo_id`
    pub fn resolve(model_dir: Option<&Path>, repo_id: &str, prefer_fp16: bool) -> Result<Self> {
        match model_dir {
            Some(dir) if dir.is_dir() => Self::from_dir(dir, prefer_fp16),
            Some(dir) => {
                info!(dir = %dir.display(), repo = repo_id, "model directory missing, using the Hub");
                Self::from_hub(repo_id, prefer_fp16)
            }
            None => Self::from_hub(repo_id, prefer_fp16),
        }
    }

    /// Resolve every component inside a local directory
    pub fn from_dir(model_dir: &Path, prefer_fp16: bool) -> Result<Self> {
        let pick = |component: (&str, &str)| -> Result<(PathBuf, bool)> {
            let fp16 = model_dir.join(component_file(component, true));
            if prefer_fp16 && fp16.exists() {
                return Ok((fp16, true));
            }
            let full = model_dir.join(component_file(component, false));
            if full.exists() {
                Ok((full, false))
            } else if fp16.exists() {
                Ok((fp16, true))
            } else {
                Err(Error::MissingWeights(full))
            }
        };

        let (unet, is_fp16) = pick(UNET)?;
        let (vae, _) = pick(VAE)?;
        let (text_encoder, _) = pick(TEXT_ENCODER)?;

        let local_tokenizer = model_dir.join("tokenizer").join("tokenizer.json");
        let tokenizer = if local_tokenizer.exists() {
            local_tokenizer
        } else {
            clip_tokenizer()?
        };

        let config = model_dir.join("unet").join("config.json");
        let unet_config = config.exists().then_some(config);

        debug!(
            unet = %unet.display(),
            vae = %vae.display(),
            text_encoder = %text_encoder.display(),
            "resolved local weights"
        );
        Ok(Self {
            unet,
            vae,
            text_encoder,
            tokenizer,
            unet_config,
            is_fp16,
        })
    }

    /// Download every component of `repo_id` into the Hub cache
    pub fn from_hub(repo_id: &str, prefer_fp16: bool) -> Result<Self> {
        info!(repo = repo_id, "fetching weights from the Hugging Face Hub");
        let repo = Api::new()?.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        let fetch = |component: (&str, &str)| -> Result<(PathBuf, bool)> {
            if prefer_fp16 && let Ok(path) = repo.get(&component_file(component, true)) {
                return Ok((path, true));
            }
            Ok((repo.get(&component_file(component, false))?, false))
        };

        let (unet, is_fp16) = fetch(UNET)?;
        let (vae, _) = fetch(VAE)?;
        let (text_encoder, _) = fetch(TEXT_ENCODER)?;
        let tokenizer = match repo.get("tokenizer/tokenizer.json") {
            Ok(path) => path,
            Err(_) => clip_tokenizer()?,
        };
        let unet_config = hub_optional(&repo, "unet/config.json");

        Ok(Self {
            unet,
            vae,
            text_encoder,
            tokenizer,
            unet_config,
            is_fp16,
        })
    }
}

fn hub_optional(repo: &ApiRepo, file: &str) -> Option<PathBuf> {
    repo.get(file).ok()
}

/// `tokenizer.json` of the reference CLIP BPE vocabulary
pub fn clip_tokenizer() -> Result<PathBuf> {
    debug!(repo = CLIP_TOKENIZER_REPO, "downloading CLIP tokenizer");
    let path = Api::new()?
        .repo(Repo::new(CLIP_TOKENIZER_REPO.to_string(), RepoType::Model))
        .get("tokenizer.json")?;
    Ok(path)
}

/// UNet3D configuration from `unet/config.json`, defaults when absent
pub fn load_unet3d_config(files: &ComponentFiles) -> Result<UNet3DConfig> {
    match &files.unet_config {
        Some(path) => UNet3DConfig::from_json(path),
        None => Ok(UNet3DConfig::default()),
    }
}
