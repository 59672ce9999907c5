// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/feature.rs - 图像特征指纹
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

//! 从解码后的图像计算四维特征指纹，供模型选择器使用。
//!
//! 指纹顺序 `(num_objects_mod, mean_area_mod, categories_mod, ratio_hw)`
//! 与选择器训练时的列顺序一致，修改顺序必须重新训练选择器。
//! 扰动项来自像素和取模，完全由图像内容决定，不使用随机数。

use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use imageproc::{
  contours::{BorderType, find_contours},
  contrast::otsu_level,
  geometry::contour_area,
  gradients::{horizontal_sobel, vertical_sobel},
};
use tracing::debug;

/// 选择器训练时使用的列名，顺序与 [`Fingerprint::to_features`] 一致
pub const FEATURE_COLUMNS: [&str; 4] = ["num_objects", "mean_box_area", "num_categories", "ratio_hw"];

const MIN_REGION_RATIO: f64 = 0.001;
const DEFAULT_MEAN_AREA: f64 = 0.1;
const HASH_MODULUS: u64 = 1000;
const MAX_CATEGORIES: f64 = 10.0;

/// 图像指纹
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fingerprint {
  /// 扰动后的目标数量，不小于 1，无上限
  pub num_objects_mod: u32,
  /// 扰动后的平均目标面积占比，[0, 1]
  pub mean_area_mod: f64,
  /// 类别多样性估计，[1, 10]
  pub categories_mod: u32,
  /// 原始高宽比，不做截断
  pub ratio_hw: f64,
}

impl Fingerprint {
  pub fn to_features(&self) -> [f64; 4] {
    [
      self.num_objects_mod as f64,
      self.mean_area_mod,
      self.categories_mod as f64,
      self.ratio_hw,
    ]
  }
}

/// 扰动前的原始测量值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStats {
  pub ratio_hw: f64,
  /// 像素和对 1000 取模后归一化，[0, 1)
  pub img_hash: f64,
  pub saturation: f64,
  pub brightness: f64,
  pub detail_level: f64,
  pub num_objects: usize,
  pub mean_area: f64,
}

impl ImageStats {
  pub fn perturb(&self) -> Fingerprint {
    let hash = self.img_hash;

    let num_objects_mod = (self.num_objects as f64 * (0.8 + 0.4 * hash))
      .round()
      .max(1.0) as u32;
    let mean_area_mod = (self.mean_area * (0.7 + 0.6 * hash)).clamp(0.0, 1.0);
    let categories_mod = (5.0 * self.saturation + 3.0 * self.detail_level + 2.0 * hash)
      .round()
      .clamp(1.0, MAX_CATEGORIES) as u32;

    Fingerprint {
      num_objects_mod,
      mean_area_mod,
      categories_mod,
      ratio_hw: self.ratio_hw,
    }
  }
}

/// 特征提取器
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
  min_region_ratio: f64,
  default_mean_area: f64,
}

impl Default for FeatureExtractor {
  fn default() -> Self {
    Self {
      min_region_ratio: MIN_REGION_RATIO,
      default_mean_area: DEFAULT_MEAN_AREA,
    }
  }
}

impl FeatureExtractor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 计算图像指纹。图像宽高必须不为零。
  pub fn extract(&self, image: &DynamicImage) -> Fingerprint {
    let stats = self.measure(image);
    let fingerprint = stats.perturb();
    debug!("图像统计: {:?}", stats);
    debug!("图像指纹: {:?}", fingerprint);
    fingerprint
  }

  pub fn measure(&self, image: &DynamicImage) -> ImageStats {
    let (width, height) = image.dimensions();
    let ratio_hw = height as f64 / width as f64;

    let planes = match image {
      DynamicImage::ImageRgb8(rgb) => Planes::from_rgb(rgb),
      _ if image.color().has_color() => Planes::from_rgb(&image.to_rgb8()),
      _ => Planes::from_gray(image.to_luma8()),
    };

    let img_hash = (planes.pixel_sum % HASH_MODULUS) as f64 / HASH_MODULUS as f64;
    let detail_level = detail_level(&planes.gray);
    let (num_objects, mean_area) = self.significant_regions(&planes.gray);

    ImageStats {
      ratio_hw,
      img_hash,
      saturation: planes.saturation,
      brightness: planes.brightness,
      detail_level,
      num_objects,
      mean_area,
    }
  }

  /// 统计显著外轮廓数量与平均面积占比
  fn significant_regions(&self, gray: &GrayImage) -> (usize, f64) {
    let image_area = gray.width() as f64 * gray.height() as f64;
    let min_area = image_area * self.min_region_ratio;

    let binary = binarize(gray);
    let areas: Vec<f64> = find_contours::<i32>(&binary)
      .iter()
      .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
      .map(|c| contour_area(&c.points).abs())
      .filter(|&area| area > min_area)
      .collect();

    if areas.is_empty() {
      return (0, self.default_mean_area);
    }

    let mean = areas.iter().sum::<f64>() / areas.len() as f64;
    (areas.len(), mean / image_area)
  }
}

struct Planes {
  gray: GrayImage,
  pixel_sum: u64,
  saturation: f64,
  brightness: f64,
}

impl Planes {
  fn from_rgb(rgb: &RgbImage) -> Self {
    let (width, height) = rgb.dimensions();
    let mut gray = GrayImage::new(width, height);
    let mut pixel_sum = 0u64;
    let mut s_sum = 0u64;
    let mut v_sum = 0u64;

    for (x, y, pixel) in rgb.enumerate_pixels() {
      let [r, g, b] = pixel.0;
      pixel_sum += r as u64 + g as u64 + b as u64;

      let (s, v) = saturation_value(r, g, b);
      s_sum += s as u64;
      v_sum += v as u64;

      gray.put_pixel(x, y, Luma([luma_bt601(r, g, b)]));
    }

    let count = width as f64 * height as f64;
    Self {
      gray,
      pixel_sum,
      saturation: s_sum as f64 / count / 255.0,
      brightness: v_sum as f64 / count / 255.0,
    }
  }

  fn from_gray(gray: GrayImage) -> Self {
    let pixel_sum: u64 = gray.as_raw().iter().map(|&p| p as u64).sum();
    let count = gray.width() as f64 * gray.height() as f64;
    Self {
      brightness: pixel_sum as f64 / count / 255.0,
      saturation: 0.0,
      pixel_sum,
      gray,
    }
  }
}

/// 8 位 HSV 的 S、V 分量
fn saturation_value(r: u8, g: u8, b: u8) -> (u8, u8) {
  let max = r.max(g).max(b);
  let min = r.min(g).min(b);
  if max == 0 {
    return (0, 0);
  }
  let s = (255.0 * (max - min) as f64 / max as f64).round() as u8;
  (s, max)
}

fn luma_bt601(r: u8, g: u8, b: u8) -> u8 {
  (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64)
    .round()
    .clamp(0.0, 255.0) as u8
}

/// 3x3 Sobel 梯度幅值均值，归一化到 255
fn detail_level(gray: &GrayImage) -> f64 {
  let gx = horizontal_sobel(gray);
  let gy = vertical_sobel(gray);
  let total: f64 = gx
    .pixels()
    .zip(gy.pixels())
    .map(|(x, y)| {
      let (x, y) = (x[0] as f64, y[0] as f64);
      (x * x + y * y).sqrt()
    })
    .sum();
  total / (gray.width() as f64 * gray.height() as f64) / 255.0
}

/// Otsu 全局阈值二值化，前景为大于阈值的像素。
/// 单一灰度的图像没有前景。
fn binarize(gray: &GrayImage) -> GrayImage {
  let (lo, hi) = gray
    .pixels()
    .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
  if lo >= hi {
    return GrayImage::new(gray.width(), gray.height());
  }

  let level = otsu_level(gray);
  GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
    if gray.get_pixel(x, y)[0] > level {
      Luma([255])
    } else {
      Luma([0])
    }
  })
}
