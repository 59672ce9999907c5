// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/selector.rs - 模型选择器
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

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  feature::Fingerprint,
  model::{ModelEntry, ModelRegistry},
};

mod decision_tree;
pub use self::decision_tree::DecisionTree;

#[derive(Error, Debug)]
pub enum SelectionError {
  #[error("选择器输出的模型 {name} 不在注册表中，可用模型: {available:?}")]
  UnknownModel { name: String, available: Vec<String> },
  #[error("无法读取选择器文件 {path}: {source}")]
  Load {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("选择器文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("选择器特征列不匹配: 期望 {expected:?}, 实际 {found:?}")]
  ColumnMismatch {
    expected: Vec<String>,
    found: Vec<String>,
  },
  #[error("决策树无效: {0}")]
  InvalidTree(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 预训练分类器：输入一行特征，输出一个模型名
pub trait Classifier: Send + Sync {
  fn predict(&self, row: &FeatureRow) -> Result<String, SelectionError>;

  /// 分类器可能输出的全部类别
  fn classes(&self) -> &[String];
}

/// 单行带列名的特征表，列顺序与训练时一致
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRow {
  values: [f64; 4],
}

impl FeatureRow {
  pub fn values(&self) -> &[f64; 4] {
    &self.values
  }
}

impl From<&Fingerprint> for FeatureRow {
  fn from(fingerprint: &Fingerprint) -> Self {
    Self {
      values: fingerprint.to_features(),
    }
  }
}

pub struct ModelSelector {
  classifier: Box<dyn Classifier>,
}

impl FromUrlWithScheme for ModelSelector {
  const SCHEME: &'static str = "tree";
}

impl FromUrl for ModelSelector {
  type Error = SelectionError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SelectionError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    let tree = DecisionTree::from_path(url.path().as_ref())?;
    Ok(Self::new(tree))
  }
}

impl ModelSelector {
  pub fn new(classifier: impl Classifier + 'static) -> Self {
    Self {
      classifier: Box::new(classifier),
    }
  }

  /// 启动时检查：分类器的每个类别都必须在注册表中
  pub fn verify(&self, registry: &ModelRegistry) -> Result<(), SelectionError> {
    for class in self.classifier.classes() {
      if !registry.contains(class) {
        error!("选择器类别 {} 没有对应的模型", class);
        return Err(unknown_model(class, registry));
      }
    }
    info!(
      "选择器类别与注册表一致: {:?}",
      self.classifier.classes()
    );
    Ok(())
  }

  pub fn select<'r>(
    &self,
    fingerprint: &Fingerprint,
    registry: &'r ModelRegistry,
  ) -> Result<&'r Arc<ModelEntry>, SelectionError> {
    let row = FeatureRow::from(fingerprint);
    let name = self.classifier.predict(&row)?;
    debug!("选择器输出: {}", name);

    registry.get(&name).ok_or_else(|| {
      error!("选择器输出的模型 {} 不在注册表中", name);
      unknown_model(&name, registry)
    })
  }
}

fn unknown_model(name: &str, registry: &ModelRegistry) -> SelectionError {
  SelectionError::UnknownModel {
    name: name.to_string(),
    available: registry.keys().map(String::from).collect(),
  }
}
