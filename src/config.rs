// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/config.rs - 运行配置
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const SELECTOR_SCHEME: &str = "tree";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 启动配置
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  /// 模型选择器位置，例如 `tree:///opt/xuanjian/selector.json`
  pub selector: Url,
  /// 键为选择器输出的模型名
  pub models: BTreeMap<String, ModelSpec>,
  #[serde(default = "default_threshold")]
  pub threshold: f32,
  /// 0 表示不限时
  #[serde(default = "default_inference_timeout_ms")]
  pub inference_timeout_ms: u64,
  #[serde(default = "default_jpeg_quality")]
  pub jpeg_quality: u8,
  /// 标签字体（TrueType），加载失败时回退到内置点阵字体
  #[serde(default)]
  pub font: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
  /// 展示给用户的模型名称
  pub name: String,
  /// 模型位置，例如 `onnx:///opt/xuanjian/ssd.onnx?width=320&height=320`
  pub model: Url,
  pub categories: CategorySource,
}

/// 类别表：直接列出，或指向每行一个标签的文本文件
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CategorySource {
  Inline(Vec<String>),
  File(PathBuf),
}

impl CategorySource {
  pub fn load(&self) -> Result<Vec<String>, std::io::Error> {
    match self {
      CategorySource::Inline(labels) => Ok(labels.clone()),
      CategorySource::File(path) => {
        let content = std::fs::read_to_string(path)?;
        Ok(
          content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        )
      }
    }
  }
}

fn default_threshold() -> f32 {
  DEFAULT_THRESHOLD
}

fn default_inference_timeout_ms() -> u64 {
  DEFAULT_INFERENCE_TIMEOUT_MS
}

fn default_jpeg_quality() -> u8 {
  DEFAULT_JPEG_QUALITY
}

impl Settings {
  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    info!("加载配置文件: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content)
  }

  pub fn from_json(content: &str) -> Result<Self, ConfigError> {
    let settings: Settings = serde_json::from_str(content)?;
    settings.validate()?;
    Ok(settings)
  }

  pub fn inference_timeout(&self) -> Option<Duration> {
    (self.inference_timeout_ms > 0).then(|| Duration::from_millis(self.inference_timeout_ms))
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.models.is_empty() {
      return Err(ConfigError::Invalid("至少需要配置一个模型".to_string()));
    }
    if !(0.0..=1.0).contains(&self.threshold) {
      return Err(ConfigError::Invalid(format!(
        "置信度阈值必须在 [0, 1] 内，实际为 {}",
        self.threshold
      )));
    }
    if !(1..=100).contains(&self.jpeg_quality) {
      return Err(ConfigError::Invalid(format!(
        "JPEG 质量必须在 1..=100 内，实际为 {}",
        self.jpeg_quality
      )));
    }
    if self.selector.scheme() != SELECTOR_SCHEME {
      return Err(ConfigError::Invalid(format!(
        "选择器位置必须使用 {} 方案，实际为 {}",
        SELECTOR_SCHEME,
        self.selector.scheme()
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"{
    "selector": "tree:///opt/xuanjian/selector.json",
    "models": {
      "ssd": {
        "name": "SSD",
        "model": "onnx:///opt/xuanjian/ssd.onnx",
        "categories": ["bg", "cat"]
      }
    }
  }"#;

  #[test]
  fn defaults_are_filled_in() {
    let settings = Settings::from_json(MINIMAL).unwrap();
    assert_eq!(settings.threshold, 0.5);
    assert_eq!(settings.jpeg_quality, 90);
    assert_eq!(settings.inference_timeout(), Some(Duration::from_secs(30)));
    assert!(settings.font.is_none());
    assert!(matches!(
      settings.models["ssd"].categories,
      CategorySource::Inline(ref labels) if labels.len() == 2
    ));
  }

  #[test]
  fn zero_timeout_disables_it() {
    let json = MINIMAL.replacen("\"selector\"", "\"inference_timeout_ms\": 0, \"selector\"", 1);
    let settings = Settings::from_json(&json).unwrap();
    assert_eq!(settings.inference_timeout(), None);
  }

  #[test]
  fn string_categories_point_to_a_file() {
    let json = MINIMAL.replace(r#"["bg", "cat"]"#, r#""/tmp/labels.txt""#);
    let settings = Settings::from_json(&json).unwrap();
    assert!(matches!(settings.models["ssd"].categories, CategorySource::File(_)));
  }

  #[test]
  fn invalid_settings_are_rejected() {
    let no_models = r#"{"selector": "tree:///s.json", "models": {}}"#;
    assert!(matches!(Settings::from_json(no_models), Err(ConfigError::Invalid(_))));

    let bad_threshold = MINIMAL.replacen("\"selector\"", "\"threshold\": 1.5, \"selector\"", 1);
    assert!(matches!(Settings::from_json(&bad_threshold), Err(ConfigError::Invalid(_))));

    let bad_scheme = MINIMAL.replace("tree:///", "file:///");
    assert!(matches!(Settings::from_json(&bad_scheme), Err(ConfigError::Invalid(_))));

    assert!(matches!(Settings::from_json("{"), Err(ConfigError::Parse(_))));
  }

  #[test]
  fn category_file_skips_blank_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "__background__\nperson\n\n  bicycle  \n").unwrap();
    let labels = CategorySource::File(path).load().unwrap();
    assert_eq!(labels, vec!["__background__", "person", "bicycle"]);
  }
}
