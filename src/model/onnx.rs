// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/model/onnx.rs - ONNX 检测模型（tract 后端）
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

//! 加载导出为 ONNX 的检测模型。模型需有一个 `[1, 3, H, W]` 的 f32 输入，
//! 依次输出 `boxes [N, 4]`、`labels [N]`、`scores [N]`，
//! 即 torchvision 检测模型导出后的默认输出顺序。

use thiserror::Error;
use tract_onnx::prelude::*;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbNchwTensor,
  model::{Detector, InferenceError, RawDetections},
};

const ONNX_NUM_OUTPUTS: usize = 3;

#[derive(Error, Debug)]
pub enum OnnxError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("输入尺寸参数无效: {0}")]
  InvalidInputSize(String),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
}

impl OnnxError {
  fn invalid(msg: &str, e: TractError) -> Self {
    OnnxError::ModelInvalid(format!("{}: {:#}", msg, e))
  }
}

pub struct OnnxDetector {
  model: TypedRunnableModel<TypedModel>,
  input_size: Option<(u32, u32)>,
}

pub struct OnnxDetectorBuilder {
  model_path: String,
  input_size: Option<(u32, u32)>,
}

impl FromUrlWithScheme for OnnxDetectorBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxDetectorBuilder {
  type Error = OnnxError;

  /// `onnx:///path/model.onnx?width=800&height=800`，宽高可省略
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OnnxError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案，实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut width = None;
    let mut height = None;
    for (k, v) in url.query_pairs() {
      let slot = match k.as_ref() {
        "width" => &mut width,
        "height" => &mut height,
        _ => continue,
      };
      let value = v
        .parse::<u32>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| OnnxError::InvalidInputSize(format!("{}={}", k, v)))?;
      *slot = Some(value);
    }

    let input_size = match (width, height) {
      (Some(w), Some(h)) => Some((w, h)),
      (None, None) => None,
      _ => {
        return Err(OnnxError::InvalidInputSize(
          "width 与 height 必须同时给出".to_string(),
        ));
      }
    };

    Ok(OnnxDetectorBuilder {
      model_path: url.path().to_string(),
      input_size,
    })
  }
}

impl OnnxDetectorBuilder {
  /// 加载、优化并编译推理计划，只在启动时调用一次
  pub fn build(self) -> Result<OnnxDetector, OnnxError> {
    info!("加载模型文件: {}", self.model_path);
    if !std::path::Path::new(&self.model_path).is_file() {
      error!("模型文件不存在: {}", self.model_path);
      return Err(OnnxError::ModelPathError(self.model_path));
    }

    let mut model = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(|e| OnnxError::invalid("无法解析 ONNX 模型", e))?;

    if let Some((w, h)) = self.input_size {
      debug!("固定模型输入尺寸: {}x{}", w, h);
      model = model
        .with_input_fact(0, f32::fact([1, 3, h as usize, w as usize]).into())
        .map_err(|e| OnnxError::invalid("无法设置输入尺寸", e))?;
    }

    let model = model
      .into_optimized()
      .map_err(|e| OnnxError::invalid("模型优化失败", e))?
      .into_runnable()
      .map_err(|e| OnnxError::invalid("无法生成推理计划", e))?;

    let num_outputs = model.model().output_outlets().map(|o| o.len()).unwrap_or(0);
    if num_outputs < ONNX_NUM_OUTPUTS {
      error!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        ONNX_NUM_OUTPUTS, num_outputs
      );
      return Err(OnnxError::ModelInvalid(format!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        ONNX_NUM_OUTPUTS, num_outputs
      )));
    }

    info!("模型加载完成");
    Ok(OnnxDetector {
      model,
      input_size: self.input_size,
    })
  }
}

fn backend(e: TractError) -> InferenceError {
  InferenceError::Backend(format!("{:#}", e))
}

impl Detector for OnnxDetector {
  fn infer(&self, input: &RgbNchwTensor) -> Result<RawDetections, InferenceError> {
    let tensor = Tensor::from_shape(&input.shape(), input.as_slice()).map_err(backend)?;

    debug!("执行模型推理");
    let outputs = self.model.run(tvec!(tensor.into())).map_err(backend)?;
    if outputs.len() < ONNX_NUM_OUTPUTS {
      return Err(InferenceError::Backend(format!(
        "模型输出数量不足: {}",
        outputs.len()
      )));
    }

    let boxes = outputs[0].cast_to::<f32>().map_err(backend)?;
    let labels = outputs[1].cast_to::<i64>().map_err(backend)?;
    let scores = outputs[2].cast_to::<f32>().map_err(backend)?;

    let boxes = boxes.as_slice::<f32>().map_err(backend)?;
    if boxes.len() % 4 != 0 {
      return Err(InferenceError::Backend(format!(
        "boxes 输出长度 {} 不是 4 的倍数",
        boxes.len()
      )));
    }

    let raw = RawDetections {
      boxes: boxes
        .chunks_exact(4)
        .map(|b| [b[0], b[1], b[2], b[3]])
        .collect(),
      labels: labels.as_slice::<i64>().map_err(backend)?.to_vec(),
      scores: scores.as_slice::<f32>().map_err(backend)?.to_vec(),
    };
    debug!("模型输出 {} 个候选框", raw.boxes.len());
    Ok(raw)
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    self.input_size
  }
}
