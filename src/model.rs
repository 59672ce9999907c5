// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/model.rs - 检测模型
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

use std::time::Duration;

use thiserror::Error;

use crate::frame::RgbNchwTensor;

/// 检测模型能力：输入张量，输出框、类别、置信度
///
/// 实现必须只读访问输入，并且可被多个请求并发调用。
pub trait Detector: Send + Sync {
  fn infer(&self, input: &RgbNchwTensor) -> Result<RawDetections, InferenceError>;

  /// 固定输入尺寸 (宽, 高)；`None` 表示接受原图尺寸
  fn input_size(&self) -> Option<(u32, u32)> {
    None
  }
}

/// 模型原始输出，三个数组按下标一一对应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
  pub boxes: Vec<[f32; 4]>,
  pub labels: Vec<i64>,
  pub scores: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
  pub label: i64,
  pub score: f32,
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入图像尺寸为空: {width}x{height}")]
  EmptyInput { width: u32, height: u32 },
  #[error("输出长度不一致: boxes={boxes}, labels={labels}, scores={scores}")]
  LengthMismatch {
    boxes: usize,
    labels: usize,
    scores: usize,
  },
  #[error("推理超时: {0:?}")]
  Timeout(Duration),
  #[error("推理线程异常退出")]
  Aborted,
  #[error("推理后端错误: {0}")]
  Backend(String),
}

mod registry;
mod runner;
#[cfg(feature = "backend-tract")]
mod onnx;

pub use self::registry::{DetectorLoader, ModelEntry, ModelRegistry, RegistryError, UrlDetectorLoader};
pub use self::runner::DetectionRunner;
#[cfg(feature = "backend-tract")]
pub use self::onnx::{OnnxDetector, OnnxDetectorBuilder, OnnxError};
