// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/selector/decision_tree.rs - 决策树分类器
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

//! 离线训练好的决策树，以 JSON 形式导出：
//!
//! ```json
//! {
//!   "feature_names": ["num_objects", "mean_box_area", "num_categories", "ratio_hw"],
//!   "classes": ["fasterrcnn", "ssdlite"],
//!   "nodes": [
//!     {"feature": 0, "threshold": 2.5, "left": 1, "right": 2},
//!     {"value": [10.0, 2.0]},
//!     {"value": [1.0, 7.0]}
//!   ]
//! }
//! ```
//!
//! 分裂节点在 `x[feature] <= threshold` 时走左子树；叶节点输出 `value` 最大的类别，
//! 并列时取靠前者。子节点下标必须大于父节点下标。

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::{Classifier, FeatureRow, SelectionError};
use crate::feature::FEATURE_COLUMNS;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Node {
  Split {
    feature: usize,
    threshold: f64,
    left: usize,
    right: usize,
  },
  Leaf {
    value: Vec<f64>,
  },
}

#[derive(Debug, Deserialize)]
struct TreeFile {
  feature_names: Vec<String>,
  classes: Vec<String>,
  nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct DecisionTree {
  classes: Vec<String>,
  nodes: Vec<Node>,
}

impl DecisionTree {
  pub fn from_path(path: &Path) -> Result<Self, SelectionError> {
    info!("加载选择器: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| SelectionError::Load {
      path: path.to_path_buf(),
      source,
    })?;
    let tree = Self::from_json(&content)?;
    info!(
      "选择器加载完成，节点数: {}, 类别: {:?}",
      tree.nodes.len(),
      tree.classes
    );
    Ok(tree)
  }

  pub fn from_json(content: &str) -> Result<Self, SelectionError> {
    let file: TreeFile = serde_json::from_str(content)?;

    if file.feature_names != FEATURE_COLUMNS {
      return Err(SelectionError::ColumnMismatch {
        expected: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        found: file.feature_names,
      });
    }

    let tree = Self {
      classes: file.classes,
      nodes: file.nodes,
    };
    tree.validate()?;
    Ok(tree)
  }

  fn validate(&self) -> Result<(), SelectionError> {
    let invalid = |msg: String| Err(SelectionError::InvalidTree(msg));

    if self.classes.is_empty() {
      return invalid("类别列表为空".to_string());
    }
    if self.nodes.is_empty() {
      return invalid("节点列表为空".to_string());
    }

    for (idx, node) in self.nodes.iter().enumerate() {
      match node {
        Node::Split {
          feature,
          threshold,
          left,
          right,
        } => {
          if *feature >= FEATURE_COLUMNS.len() {
            return invalid(format!("节点 {} 的特征下标 {} 越界", idx, feature));
          }
          if !threshold.is_finite() {
            return invalid(format!("节点 {} 的阈值不是有限数", idx));
          }
          for child in [left, right] {
            if *child <= idx || *child >= self.nodes.len() {
              return invalid(format!("节点 {} 的子节点下标 {} 无效", idx, child));
            }
          }
        }
        Node::Leaf { value } => {
          if value.len() != self.classes.len() {
            return invalid(format!(
              "叶节点 {} 的取值长度 {} 与类别数 {} 不一致",
              idx,
              value.len(),
              self.classes.len()
            ));
          }
        }
      }
    }

    Ok(())
  }

  fn leaf_for(&self, values: &[f64; 4]) -> &[f64] {
    let mut idx = 0;
    // 子节点下标严格递增，循环必然终止
    loop {
      match &self.nodes[idx] {
        Node::Split {
          feature,
          threshold,
          left,
          right,
        } => {
          idx = if values[*feature] <= *threshold {
            *left
          } else {
            *right
          };
        }
        Node::Leaf { value } => {
          debug!("决策树到达叶节点 {}", idx);
          return value;
        }
      }
    }
  }
}

impl Classifier for DecisionTree {
  fn predict(&self, row: &FeatureRow) -> Result<String, SelectionError> {
    let value = self.leaf_for(row.values());
    let best = value
      .iter()
      .enumerate()
      .fold(0, |best, (i, v)| if *v > value[best] { i } else { best });
    Ok(self.classes[best].clone())
  }

  fn classes(&self) -> &[String] {
    &self.classes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::feature::Fingerprint;

  const TREE: &str = r#"{
    "feature_names": ["num_objects", "mean_box_area", "num_categories", "ratio_hw"],
    "classes": ["frcnn", "ssd", "retina"],
    "nodes": [
      {"feature": 0, "threshold": 2.5, "left": 1, "right": 2},
      {"value": [1.0, 9.0, 0.0]},
      {"feature": 3, "threshold": 1.2, "left": 3, "right": 4},
      {"value": [5.0, 1.0, 5.0]},
      {"value": [0.0, 0.0, 3.0]}
    ]
  }"#;

  fn row(num_objects: u32, ratio_hw: f64) -> FeatureRow {
    FeatureRow::from(&Fingerprint {
      num_objects_mod: num_objects,
      mean_area_mod: 0.1,
      categories_mod: 2,
      ratio_hw,
    })
  }

  #[test]
  fn follows_splits_to_leaves() {
    let tree = DecisionTree::from_json(TREE).unwrap();
    assert_eq!(tree.predict(&row(1, 1.0)).unwrap(), "ssd");
    assert_eq!(tree.predict(&row(3, 2.0)).unwrap(), "retina");
    assert_eq!(tree.classes(), &["frcnn", "ssd", "retina"]);
  }

  #[test]
  fn threshold_is_inclusive_on_the_left() {
    let tree = DecisionTree::from_json(TREE).unwrap();
    // ratio_hw == 1.2 走左子树
    assert_eq!(tree.predict(&row(3, 1.2)).unwrap(), "frcnn");
  }

  #[test]
  fn ties_pick_the_first_class() {
    let tree = DecisionTree::from_json(TREE).unwrap();
    assert_eq!(tree.predict(&row(5, 0.5)).unwrap(), "frcnn");
  }

  #[test]
  fn unbounded_ratio_is_accepted() {
    let tree = DecisionTree::from_json(TREE).unwrap();
    assert_eq!(tree.predict(&row(3, 1e9)).unwrap(), "retina");
  }

  #[test]
  fn wrong_columns_are_rejected() {
    let json = TREE.replace("mean_box_area", "mean_area");
    assert!(matches!(
      DecisionTree::from_json(&json),
      Err(SelectionError::ColumnMismatch { .. })
    ));
  }

  #[test]
  fn malformed_trees_are_rejected() {
    let backwards = TREE.replace(r#""left": 3"#, r#""left": 1"#);
    let out_of_range = TREE.replace(r#""right": 4"#, r#""right": 9"#);
    let short_leaf = TREE.replace("[0.0, 0.0, 3.0]", "[0.0, 3.0]");
    let bad_feature = TREE.replace(r#""feature": 3"#, r#""feature": 4"#);
    for json in [backwards, out_of_range, short_leaf, bad_feature] {
      assert!(matches!(
        DecisionTree::from_json(&json),
        Err(SelectionError::InvalidTree(_))
      ));
    }

    let no_nodes = r#"{"feature_names": ["num_objects", "mean_box_area", "num_categories", "ratio_hw"], "classes": ["a"], "nodes": []}"#;
    assert!(matches!(
      DecisionTree::from_json(no_nodes),
      Err(SelectionError::InvalidTree(_))
    ));
  }

  #[test]
  fn loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("selector.json");
    std::fs::write(&path, TREE).unwrap();
    assert!(DecisionTree::from_path(&path).is_ok());
    assert!(matches!(
      DecisionTree::from_path(&dir.path().join("missing.json")),
      Err(SelectionError::Load { .. })
    ));
  }
}
