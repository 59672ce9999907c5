// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use thiserror::Error;
use tracing::debug;

use crate::{model::Detection, output::font::LabelFont};

const DEFAULT_THRESHOLD: f32 = 0.5;
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_STROKE: i32 = 3;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_OUTLINE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const TEXT_OFFSET_X: i32 = 3;
const TEXT_OFFSET_Y: i32 = -3;

const OUTLINE_OFFSETS: [(i32, i32); 8] = [
  (-1, -1),
  (0, -1),
  (1, -1),
  (-1, 0),
  (1, 0),
  (-1, 1),
  (0, 1),
  (1, 1),
];

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("类别下标 {label} 超出范围（类别数 {len}）")]
  LabelOutOfRange { label: i64, len: usize },
}

pub struct Annotator {
  threshold: f32,
  font: LabelFont,
}

impl Default for Annotator {
  fn default() -> Self {
    Self::new(LabelFont::default())
  }
}

impl Annotator {
  pub fn new(font: LabelFont) -> Self {
    Self {
      threshold: DEFAULT_THRESHOLD,
      font,
    }
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  /// 在图像副本上绘制置信度不低于阈值的检测框与标签，输入图像保持不变
  pub fn annotate(
    &self,
    image: &RgbImage,
    detections: &[Detection],
    categories: &[String],
  ) -> Result<RgbImage, RenderError> {
    // 先校验再绘制，出错时不产生半成品
    let mut labelled = Vec::new();
    for detection in detections.iter().filter(|d| self.is_visible(d)) {
      let category = usize::try_from(detection.label)
        .ok()
        .and_then(|i| categories.get(i))
        .ok_or(RenderError::LabelOutOfRange {
          label: detection.label,
          len: categories.len(),
        })?;
      labelled.push((detection, category));
    }

    let mut canvas = image.clone();
    for (detection, category) in labelled.iter() {
      let text = label_text(category, detection.score);
      self.draw_bbox_with_label(&mut canvas, &detection.bbox, &text);
    }
    debug!(
      "绘制 {} / {} 个检测结果",
      labelled.len(),
      detections.len()
    );

    Ok(canvas)
  }

  // NaN 分数永远不满足比较
  fn is_visible(&self, detection: &Detection) -> bool {
    detection.score >= self.threshold
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32; 4], text: &str) {
    let (image_w, image_h) = (image.width() as i64, image.height() as i64);
    // 截断到图像外一圈，超出部分本就不可见
    let margin = BOX_STROKE as i64 + 1;
    let x_min = to_pixel(bbox[0], 0, -margin, image_w + margin);
    let y_min = to_pixel(bbox[1], 0, -margin, image_h + margin);
    let x_max = to_pixel(bbox[2], 0, -margin, image_w + margin);
    let y_max = to_pixel(bbox[3], 0, -margin, image_h + margin);

    // 边框向内加粗，颠倒的框不画边框但仍画标签
    for t in 0..BOX_STROKE {
      let width = x_max - x_min - 2 * t + 1;
      let height = y_max - y_min - 2 * t + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }

    let (text_w, text_h) = self.font.text_size(text);
    let text_x = to_pixel(bbox[0], TEXT_OFFSET_X, -(text_w as i64) - 2, image_w);
    let text_y = to_pixel(bbox[1], TEXT_OFFSET_Y, -(text_h as i64) - 2, image_h);
    for (dx, dy) in OUTLINE_OFFSETS {
      self
        .font
        .draw_text(image, TEXT_OUTLINE_COLOR, text_x + dx, text_y + dy, text);
    }
    self.font.draw_text(image, TEXT_COLOR, text_x, text_y, text);
  }
}

/// 标签文字："类别 百分比%"，百分比四舍五入为整数
fn label_text(category: &str, score: f32) -> String {
  format!("{} {}%", category, (score * 100.0).round() as i64)
}

// f32 转 i64 饱和，NaN 为 0
fn to_pixel(value: f32, offset: i32, min: i64, max: i64) -> i32 {
  (value.round() as i64)
    .saturating_add(offset as i64)
    .clamp(min, max) as i32
}
