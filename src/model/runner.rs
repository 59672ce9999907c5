// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/model/runner.rs - 检测执行
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
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{debug, warn};

use crate::{
  frame::RgbNchwTensor,
  model::{Detection, Detector, InferenceError, ModelEntry, RawDetections},
};

#[derive(Debug, Clone, Default)]
pub struct DetectionRunner {
  timeout: Option<Duration>,
  running: Arc<AtomicUsize>,
}

// 推理线程退出（包括 panic）时计数减一
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl DetectionRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置推理超时。推理本身无法中断，超时后推理线程会一直运行到检测器返回，
  /// 期间持有检测器与输入张量；同时存在的线程数即连续超时的请求数，会记录在日志中。
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// 对图像执行一次前向推理，返回原图像素坐标下的检测结果
  pub fn run(&self, image: &RgbImage, entry: &ModelEntry) -> Result<Vec<Detection>, InferenceError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(InferenceError::EmptyInput { width, height });
    }

    let tensor = match entry.detector.input_size() {
      Some((w, h)) => RgbNchwTensor::from_rgb_image_resized(image, w, h),
      None => RgbNchwTensor::from(image),
    };
    let scale_x = width as f32 / tensor.width() as f32;
    let scale_y = height as f32 / tensor.height() as f32;

    debug!("模型 {} 输入张量: {:?}", entry.key, tensor.shape());
    let now = Instant::now();
    let raw = self.infer(&entry.detector, tensor)?;
    debug!("模型 {} 推理耗时: {:.2?}", entry.key, now.elapsed());

    let RawDetections {
      boxes,
      labels,
      scores,
    } = raw;
    if boxes.len() != labels.len() || boxes.len() != scores.len() {
      return Err(InferenceError::LengthMismatch {
        boxes: boxes.len(),
        labels: labels.len(),
        scores: scores.len(),
      });
    }

    Ok(
      boxes
        .into_iter()
        .zip(labels)
        .zip(scores)
        .map(|((bbox, label), score)| Detection {
          bbox: [
            bbox[0] * scale_x,
            bbox[1] * scale_y,
            bbox[2] * scale_x,
            bbox[3] * scale_y,
          ],
          label,
          score,
        })
        .collect(),
    )
  }

  fn infer(
    &self,
    detector: &Arc<dyn Detector>,
    tensor: RgbNchwTensor,
  ) -> Result<RawDetections, InferenceError> {
    let Some(timeout) = self.timeout else {
      return detector.infer(&tensor);
    };

    let (tx, rx) = mpsc::channel();
    let detector = Arc::clone(detector);
    self.running.fetch_add(1, Ordering::SeqCst);
    let guard = RunningGuard(Arc::clone(&self.running));
    thread::spawn(move || {
      let _guard = guard;
      let _ = tx.send(detector.infer(&tensor));
    });

    match rx.recv_timeout(timeout) {
      Ok(result) => result,
      Err(mpsc::RecvTimeoutError::Timeout) => {
        warn!(
          "推理超过 {:?}，放弃本次请求，仍在运行的推理线程: {}",
          timeout,
          self.running.load(Ordering::SeqCst)
        );
        Err(InferenceError::Timeout(timeout))
      }
      Err(mpsc::RecvTimeoutError::Disconnected) => Err(InferenceError::Aborted),
    }
  }
}
