// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/pipeline.rs - 单次请求处理流程
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

//! 图像 → 指纹 → 选择模型 → 检测 → 标注 → JPEG。
//!
//! 所有状态在启动时构建一次，之后只读，可被多个工作线程共享引用。

use std::{sync::Arc, time::Instant};

use image::{DynamicImage, RgbImage};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  FromUrl,
  config::Settings,
  feature::{FeatureExtractor, Fingerprint},
  frame::{self, DecodeError},
  input::Request,
  model::{
    DetectionRunner, DetectorLoader, InferenceError, ModelEntry, ModelRegistry, RegistryError,
    UrlDetectorLoader,
  },
  output::{
    draw::{Annotator, RenderError},
    font::LabelFont,
  },
  selector::{ModelSelector, SelectionError},
};

const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum StartupError {
  #[error("模型注册表加载失败: {0}")]
  Registry(#[from] RegistryError),
  #[error("模型选择器加载失败: {0}")]
  Selection(#[from] SelectionError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("图像解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("模型选择失败: {0}")]
  Selection(#[from] SelectionError),
  #[error("检测失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("绘制失败: {0}")]
  Render(#[from] RenderError),
  #[error("JPEG 编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

impl PipelineError {
  /// 选择器与注册表不一致属于配置错误，服务不应继续
  pub fn is_fatal(&self) -> bool {
    matches!(self, PipelineError::Selection(_))
  }

  /// 返回给用户的失败提示
  pub fn user_message(&self) -> &'static str {
    match self {
      PipelineError::Decode(_) => "Sorry, I could not read that image. Please send a valid photo.",
      PipelineError::Selection(_) => {
        "Sorry, the service is misconfigured and cannot process images right now."
      }
      PipelineError::Inference(InferenceError::Timeout(_)) => {
        "Sorry, detection took too long for this image. Please try again."
      }
      PipelineError::Inference(_) => "Sorry, object detection failed for this image.",
      PipelineError::Render(_) => "Sorry, the detections for this image could not be drawn.",
      PipelineError::Encode(_) => "Sorry, the annotated image could not be encoded.",
    }
  }
}

/// 一次请求的回复：标注后的 JPEG 与说明文字
#[derive(Debug, Clone)]
pub struct Reply {
  pub request_id: String,
  pub model_key: String,
  pub caption: String,
  pub image: Vec<u8>,
}

/// 标注结果（编码前）
#[derive(Debug)]
pub struct Annotation {
  pub entry: Arc<ModelEntry>,
  pub fingerprint: Fingerprint,
  pub detections: usize,
  pub image: RgbImage,
}

impl Annotation {
  pub fn caption(&self) -> String {
    format!("Model used: {}", self.entry.name)
  }
}

pub struct Pipeline {
  extractor: FeatureExtractor,
  selector: ModelSelector,
  registry: ModelRegistry,
  runner: DetectionRunner,
  annotator: Annotator,
  jpeg_quality: u8,
}

impl Pipeline {
  pub fn new(selector: ModelSelector, registry: ModelRegistry) -> Self {
    Self {
      extractor: FeatureExtractor::default(),
      selector,
      registry,
      runner: DetectionRunner::default(),
      annotator: Annotator::default(),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    }
  }

  pub fn with_runner(mut self, runner: DetectionRunner) -> Self {
    self.runner = runner;
    self
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = annotator;
    self
  }

  pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
    self.jpeg_quality = quality;
    self
  }

  pub fn registry(&self) -> &ModelRegistry {
    &self.registry
  }

  /// 按配置加载全部模型与选择器，并检查二者一致
  pub fn from_settings(settings: &Settings) -> Result<Self, StartupError> {
    Self::from_settings_with_loader(settings, &UrlDetectorLoader)
  }

  pub fn from_settings_with_loader(
    settings: &Settings,
    loader: &dyn DetectorLoader,
  ) -> Result<Self, StartupError> {
    let registry = ModelRegistry::load(settings, loader)?;
    let selector = ModelSelector::from_url(&settings.selector)?;
    selector.verify(&registry)?;

    let font = LabelFont::load_or_default(settings.font.as_deref());
    let annotator = Annotator::new(font).with_threshold(settings.threshold);
    let runner = DetectionRunner::new().with_timeout(settings.inference_timeout());

    info!(
      "处理流程就绪: {} 个模型, 阈值 {}, 推理超时 {:?}",
      registry.len(),
      settings.threshold,
      settings.inference_timeout()
    );

    Ok(
      Self::new(selector, registry)
        .with_runner(runner)
        .with_annotator(annotator)
        .with_jpeg_quality(settings.jpeg_quality),
    )
  }

  /// 处理一次请求；失败时不产生任何部分结果
  pub fn process(&self, request: &Request) -> Result<Reply, PipelineError> {
    info!(
      "收到请求 {} ({} 字节, {})",
      request.id,
      request.bytes.len(),
      request.received_at.to_rfc3339()
    );
    let now = Instant::now();

    let result = frame::decode(&request.bytes)
      .map_err(PipelineError::from)
      .and_then(|image| self.process_image(&image))
      .and_then(|annotation| {
        let image = frame::encode_jpeg(&annotation.image, self.jpeg_quality)?;
        Ok(Reply {
          request_id: request.id.clone(),
          model_key: annotation.entry.key.clone(),
          caption: annotation.caption(),
          image,
        })
      });

    match &result {
      Ok(reply) => info!(
        "请求 {} 完成: 模型 {}, 耗时 {:.2?}",
        request.id,
        reply.model_key,
        now.elapsed()
      ),
      Err(e) => warn!("请求 {} 失败: {}, 耗时 {:.2?}", request.id, e, now.elapsed()),
    }
    result
  }

  /// 对已解码的图像执行指纹、选择、检测与标注
  /// 指纹与检测都基于转换后的三通道图像
  pub fn process_image(&self, image: &DynamicImage) -> Result<Annotation, PipelineError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let fingerprint = self.extractor.extract(&rgb);
    info!("图像指纹: {:?}", fingerprint);

    let entry = Arc::clone(self.selector.select(&fingerprint, &self.registry)?);
    info!("选择模型: {} ({})", entry.key, entry.name);

    let rgb = rgb.into_rgb8();
    let detections = self.runner.run(&rgb, &entry)?;
    info!("模型 {} 输出 {} 个检测结果", entry.key, detections.len());

    let annotated = self.annotator.annotate(&rgb, &detections, &entry.categories)?;

    Ok(Annotation {
      entry,
      fingerprint,
      detections: detections.len(),
      image: annotated,
    })
  }
}
