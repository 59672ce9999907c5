// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/frame.rs - 图像解码、编码与 NCHW 张量
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

use std::io::Cursor;

use image::{DynamicImage, ImageReader, RgbImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use ndarray::Array4;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("无法识别图像格式: {0}")]
  UnknownFormat(std::io::Error),
  #[error("图像解码失败: {0}")]
  Image(#[from] image::ImageError),
  #[error("图像尺寸为空: {width}x{height}")]
  Empty { width: u32, height: u32 },
}

/// 解码任意编码的图像字节，格式由内容推断
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(DecodeError::UnknownFormat)?
    .decode()?;

  if image.width() == 0 || image.height() == 0 {
    return Err(DecodeError::Empty {
      width: image.width(),
      height: image.height(),
    });
  }

  Ok(image)
}

/// 将任意编码的图像字节解码为 RGB 图像
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
  decode(bytes).map(DynamicImage::into_rgb8)
}

/// 将 RGB 图像编码为 JPEG 字节
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
  let mut buffer = Vec::new();
  JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
  Ok(buffer)
}

/// 通道优先、归一化到 [0, 1] 的单批次张量，形状为 [1, 3, H, W]
#[derive(Debug, Clone)]
pub struct RgbNchwTensor {
  data: Array4<f32>,
}

impl RgbNchwTensor {
  pub fn height(&self) -> usize {
    self.data.shape()[2]
  }

  pub fn width(&self) -> usize {
    self.data.shape()[3]
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height(), self.width()]
  }

  pub fn view(&self) -> ndarray::ArrayView4<'_, f32> {
    self.data.view()
  }

  /// 按标准（行优先）布局返回连续数据
  pub fn as_slice(&self) -> &[f32] {
    // from_shape_fn 构造的数组总是标准布局
    self.data.as_slice().unwrap_or(&[])
  }

  /// 先缩放到给定尺寸再转换
  pub fn from_rgb_image_resized(image: &RgbImage, width: u32, height: u32) -> Self {
    if image.dimensions() == (width, height) {
      return Self::from(image);
    }
    let resized = image::imageops::resize(image, width, height, FilterType::Triangle);
    Self::from(&resized)
  }
}

impl From<&RgbImage> for RgbNchwTensor {
  fn from(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let data = Array4::from_shape_fn(
      (1, RGB_CHANNELS, height as usize, width as usize),
      |(_, c, h, w)| image.get_pixel(w as u32, h as u32)[c] as f32 / 255.0,
    );
    Self { data }
  }
}
