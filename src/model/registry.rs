// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/model/registry.rs - 模型注册表
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

use std::{collections::BTreeMap, fmt, sync::Arc};

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{config::Settings, model::Detector};

#[cfg(feature = "backend-tract")]
use crate::{FromUrl, FromUrlWithScheme, model::OnnxDetectorBuilder, model::OnnxError};

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("模型 {key} 的类别表无法读取: {source}")]
  Categories {
    key: String,
    source: std::io::Error,
  },
  #[error("模型 {0} 的类别表为空")]
  EmptyCategories(String),
  #[error("不支持的模型方案: {0}")]
  UnsupportedScheme(String),
  #[cfg(feature = "backend-tract")]
  #[error("ONNX 模型错误: {0}")]
  Onnx(#[from] OnnxError),
}

/// 根据模型位置加载检测器
pub trait DetectorLoader {
  fn load(&self, location: &Url) -> Result<Arc<dyn Detector>, RegistryError>;
}

/// 按 URL 方案分发的默认加载器
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlDetectorLoader;

impl DetectorLoader for UrlDetectorLoader {
  fn load(&self, location: &Url) -> Result<Arc<dyn Detector>, RegistryError> {
    match location.scheme() {
      #[cfg(feature = "backend-tract")]
      OnnxDetectorBuilder::SCHEME => {
        let detector = OnnxDetectorBuilder::from_url(location)?.build()?;
        Ok(Arc::new(detector))
      }
      scheme => Err(RegistryError::UnsupportedScheme(scheme.to_string())),
    }
  }
}

/// 已加载的模型及其类别表，启动后只读
pub struct ModelEntry {
  pub key: String,
  pub name: String,
  pub categories: Box<[String]>,
  pub detector: Arc<dyn Detector>,
}

impl fmt::Debug for ModelEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelEntry")
      .field("key", &self.key)
      .field("name", &self.name)
      .field("categories", &self.categories.len())
      .field("input_size", &self.detector.input_size())
      .finish()
  }
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
  entries: BTreeMap<String, Arc<ModelEntry>>,
}

impl ModelRegistry {
  /// 加载配置中的全部模型，任何一个失败都会中止启动
  pub fn load(settings: &Settings, loader: &dyn DetectorLoader) -> Result<Self, RegistryError> {
    let mut entries = BTreeMap::new();

    for (key, spec) in &settings.models {
      info!("加载模型 {} ({}): {}", key, spec.name, spec.model);

      let categories = spec
        .categories
        .load()
        .map_err(|source| RegistryError::Categories {
          key: key.clone(),
          source,
        })?;
      if categories.is_empty() {
        error!("模型 {} 的类别表为空", key);
        return Err(RegistryError::EmptyCategories(key.clone()));
      }

      let detector = loader.load(&spec.model).inspect_err(|e| {
        error!("模型 {} 加载失败: {}", key, e);
      })?;

      info!("模型 {} 加载完成，类别数: {}", key, categories.len());
      entries.insert(
        key.clone(),
        Arc::new(ModelEntry {
          key: key.clone(),
          name: spec.name.clone(),
          categories: categories.into_boxed_slice(),
          detector,
        }),
      );
    }

    Ok(Self { entries })
  }

  pub fn from_entries(entries: impl IntoIterator<Item = ModelEntry>) -> Self {
    Self {
      entries: entries
        .into_iter()
        .map(|entry| (entry.key.clone(), Arc::new(entry)))
        .collect(),
    }
  }

  pub fn get(&self, key: &str) -> Option<&Arc<ModelEntry>> {
    self.entries.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
