//! Configuration of the ModelScope text-to-video UNet

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownBlockType {
    CrossAttnDownBlock3D,
    DownBlock3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpBlockType {
    CrossAttnUpBlock3D,
    UpBlock3D,
}

/// `UNet3DConditionModel` parameters, readable from a diffusers `config.json`.
///
/// Unknown keys in the JSON file are ignored and missing ones fall back to
/// the `damo-vilab/text-to-video-ms-1.7b` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UNet3DConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<DownBlockType>,
    pub up_block_types: Vec<UpBlockType>,
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    /// Channels per attention head; head count is `channels / attention_head_dim`
    pub attention_head_dim: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    /// Heads of the temporal transformer applied right after `conv_in`
    pub transformer_in_heads: usize,
    /// Query chunk length for attention, `None` computes it in one pass
    #[serde(skip)]
    pub sliced_attention_size: Option<usize>,
}

impl Default for UNet3DConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![320, 640, 1280, 1280],
            down_block_types: vec![
                DownBlockType::CrossAttnDownBlock3D,
                DownBlockType::CrossAttnDownBlock3D,
                DownBlockType::CrossAttnDownBlock3D,
                DownBlockType::DownBlock3D,
            ],
            up_block_types: vec![
                UpBlockType::UpBlock3D,
                UpBlockType::CrossAttnUpBlock3D,
                UpBlockType::CrossAttnUpBlock3D,
                UpBlockType::CrossAttnUpBlock3D,
            ],
            layers_per_block: 2,
            cross_attention_dim: 1024,
            attention_head_dim: 64,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            transformer_in_heads: 8,
            sliced_attention_size: None,
        }
    }
}

impl UNet3DConfig {
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_str(&text).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_sliced_attention(mut self, size: Option<usize>) -> Self {
        self.sliced_attention_size = size;
        self
    }

    pub fn time_embed_dim(&self) -> usize {
        self.block_out_channels[0] * 4
    }

    /// Attention heads used by blocks with `channels` features
    pub fn heads_for(&self, channels: usize) -> usize {
        (channels / self.attention_head_dim).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.block_out_channels.len();
        if n == 0 {
            return Err(Error::InvalidConfig(
                "block_out_channels must not be empty".to_string(),
            ));
        }
        if self.down_block_types.len() != n || self.up_block_types.len() != n {
            return Err(Error::InvalidConfig(format!(
                "expected {n} down and up block types, got {} and {}",
                self.down_block_types.len(),
                self.up_block_types.len()
            )));
        }
        if let Some(c) = self
            .block_out_channels
            .iter()
            .find(|c| **c % self.norm_num_groups != 0 || **c % self.attention_head_dim != 0)
        {
            return Err(Error::InvalidConfig(format!(
                "block channels {c} must be divisible by norm_num_groups ({}) and attention_head_dim ({})",
                self.norm_num_groups, self.attention_head_dim
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diffusers_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "_class_name": "UNet3DConditionModel",
                "act_fn": "silu",
                "attention_head_dim": 64,
                "block_out_channels": [320, 640, 1280, 1280],
                "cross_attention_dim": 1024,
                "down_block_types": ["CrossAttnDownBlock3D", "CrossAttnDownBlock3D", "CrossAttnDownBlock3D", "DownBlock3D"],
                "in_channels": 4,
                "layers_per_block": 2,
                "norm_eps": 1e-05,
                "norm_num_groups": 32,
                "out_channels": 4,
                "sample_size": 32,
                "up_block_types": ["UpBlock3D", "CrossAttnUpBlock3D", "CrossAttnUpBlock3D", "CrossAttnUpBlock3D"]
            }"#,
        )
        .unwrap();

        let config = UNet3DConfig::from_json(&path).unwrap();
        assert_eq!(config.block_out_channels, vec![320, 640, 1280, 1280]);
        assert_eq!(config.down_block_types[3], DownBlockType::DownBlock3D);
        assert_eq!(config.up_block_types[0], UpBlockType::UpBlock3D);
        assert_eq!(config.transformer_in_heads, 8);
        assert_eq!(config.time_embed_dim(), 1280);
        assert_eq!(config.heads_for(640), 10);
    }

    #[test]
    fn test_rejects_mismatched_block_types() {
        let config = UNet3DConfig {
            up_block_types: vec![UpBlockType::UpBlock3D],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
