// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/output/font.rs - 标签字体
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use tracing::{info, warn};

const LABEL_FONT_SIZE: f32 = 16.0;
const BITMAP_SCALE: u32 = 2;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;

/// 标签字体：优先 TrueType，缺失时使用内置 5x7 点阵字体
pub enum LabelFont {
  TrueType { font: FontArc, scale: PxScale },
  Bitmap { scale: u32 },
}

impl Default for LabelFont {
  fn default() -> Self {
    LabelFont::Bitmap {
      scale: BITMAP_SCALE,
    }
  }
}

impl LabelFont {
  /// 加载字体文件，失败时回退到点阵字体（不会报错）
  pub fn load_or_default(path: Option<&Path>) -> Self {
    let Some(path) = path else {
      info!("未配置标签字体，使用内置点阵字体");
      return Self::default();
    };

    match std::fs::read(path).map(FontArc::try_from_vec) {
      Ok(Ok(font)) => {
        info!("加载标签字体: {}", path.display());
        LabelFont::TrueType {
          font,
          scale: PxScale::from(LABEL_FONT_SIZE),
        }
      }
      Ok(Err(e)) => {
        warn!("字体文件无效 {}: {}，使用内置点阵字体", path.display(), e);
        Self::default()
      }
      Err(e) => {
        warn!("无法读取字体 {}: {}，使用内置点阵字体", path.display(), e);
        Self::default()
      }
    }
  }

  pub fn is_bitmap(&self) -> bool {
    matches!(self, LabelFont::Bitmap { .. })
  }

  /// 文本占用的像素尺寸 (宽, 高)
  pub fn text_size(&self, text: &str) -> (u32, u32) {
    match self {
      LabelFont::TrueType { font, scale } => text_size(*scale, font, text),
      LabelFont::Bitmap { scale } => {
        let chars = text.chars().count() as u32;
        if chars == 0 {
          return (0, 0);
        }
        ((chars * GLYPH_ADVANCE - 1) * scale, GLYPH_HEIGHT * scale)
      }
    }
  }

  /// 以 (x, y) 为左上角绘制文本，超出图像的部分被裁剪
  pub fn draw_text(&self, image: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
    match self {
      LabelFont::TrueType { font, scale } => draw_text_mut(image, color, x, y, *scale, font, text),
      LabelFont::Bitmap { scale } => draw_bitmap_text(image, color, x, y, *scale, text),
    }
  }
}

fn draw_bitmap_text(image: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, scale: u32, text: &str) {
  let scale = scale as i32;
  for (i, ch) in text.chars().enumerate() {
    let origin_x = x + (i as u32 * GLYPH_ADVANCE) as i32 * scale;
    for (col, bits) in glyph(ch).iter().enumerate() {
      for row in 0..GLYPH_HEIGHT {
        if bits & (1 << row) == 0 {
          continue;
        }
        let px = origin_x + col as i32 * scale;
        let py = y + row as i32 * scale;
        for dy in 0..scale {
          for dx in 0..scale {
            put_clipped(image, px + dx, py + dy, color);
          }
        }
      }
    }
  }
}

fn put_clipped(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
  if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
    image.put_pixel(x as u32, y as u32, color);
  }
}

/// 按列存储，低位在上；非 ASCII 字符显示为 '?'
fn glyph(ch: char) -> &'static [u8] {
  let code = match ch as u32 {
    code @ 0x20..0x7f => code,
    _ => '?' as u32,
  };
  let start = (code - 0x20) as usize * GLYPH_WIDTH as usize;
  &GLYPHS[start..start + GLYPH_WIDTH as usize]
}

// 0x20..0x7f，每个字符 5 列
const GLYPHS: [u8; 95 * 5] = [
  0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5f, 0x00, 0x00, 0x00, 0x07, 0x00, 0x07, 0x00,
  0x14, 0x7f, 0x14, 0x7f, 0x14, 0x24, 0x2a, 0x7f, 0x2a, 0x12, 0x23, 0x13, 0x08, 0x64, 0x62,
  0x36, 0x49, 0x55, 0x22, 0x50, 0x00, 0x05, 0x03, 0x00, 0x00, 0x00, 0x1c, 0x22, 0x41, 0x00,
  0x00, 0x41, 0x22, 0x1c, 0x00, 0x08, 0x2a, 0x1c, 0x2a, 0x08, 0x08, 0x08, 0x3e, 0x08, 0x08,
  0x00, 0x50, 0x30, 0x00, 0x00, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00, 0x60, 0x60, 0x00, 0x00,
  0x20, 0x10, 0x08, 0x04, 0x02, 0x3e, 0x51, 0x49, 0x45, 0x3e, 0x00, 0x42, 0x7f, 0x40, 0x00,
  0x42, 0x61, 0x51, 0x49, 0x46, 0x21, 0x41, 0x45, 0x4b, 0x31, 0x18, 0x14, 0x12, 0x7f, 0x10,
  0x27, 0x45, 0x45, 0x45, 0x39, 0x3c, 0x4a, 0x49, 0x49, 0x30, 0x01, 0x71, 0x09, 0x05, 0x03,
  0x36, 0x49, 0x49, 0x49, 0x36, 0x06, 0x49, 0x49, 0x29, 0x1e, 0x00, 0x36, 0x36, 0x00, 0x00,
  0x00, 0x56, 0x36, 0x00, 0x00, 0x08, 0x14, 0x22, 0x41, 0x00, 0x14, 0x14, 0x14, 0x14, 0x14,
  0x00, 0x41, 0x22, 0x14, 0x08, 0x02, 0x01, 0x51, 0x09, 0x06, 0x32, 0x49, 0x79, 0x41, 0x3e,
  0x7e, 0x11, 0x11, 0x11, 0x7e, 0x7f, 0x49, 0x49, 0x49, 0x36, 0x3e, 0x41, 0x41, 0x41, 0x22,
  0x7f, 0x41, 0x41, 0x22, 0x1c, 0x7f, 0x49, 0x49, 0x49, 0x41, 0x7f, 0x09, 0x09, 0x09, 0x01,
  0x3e, 0x41, 0x49, 0x49, 0x7a, 0x7f, 0x08, 0x08, 0x08, 0x7f, 0x00, 0x41, 0x7f, 0x41, 0x00,
  0x20, 0x40, 0x41, 0x3f, 0x01, 0x7f, 0x08, 0x14, 0x22, 0x41, 0x7f, 0x40, 0x40, 0x40, 0x40,
  0x7f, 0x02, 0x0c, 0x02, 0x7f, 0x7f, 0x04, 0x08, 0x10, 0x7f, 0x3e, 0x41, 0x41, 0x41, 0x3e,
  0x7f, 0x09, 0x09, 0x09, 0x06, 0x3e, 0x41, 0x51, 0x21, 0x5e, 0x7f, 0x09, 0x19, 0x29, 0x46,
  0x46, 0x49, 0x49, 0x49, 0x31, 0x01, 0x01, 0x7f, 0x01, 0x01, 0x3f, 0x40, 0x40, 0x40, 0x3f,
  0x1f, 0x20, 0x40, 0x20, 0x1f, 0x3f, 0x40, 0x38, 0x40, 0x3f, 0x63, 0x14, 0x08, 0x14, 0x63,
  0x07, 0x08, 0x70, 0x08, 0x07, 0x61, 0x51, 0x49, 0x45, 0x43, 0x00, 0x7f, 0x41, 0x41, 0x00,
  0x02, 0x04, 0x08, 0x10, 0x20, 0x00, 0x41, 0x41, 0x7f, 0x00, 0x04, 0x02, 0x01, 0x02, 0x04,
  0x40, 0x40, 0x40, 0x40, 0x40, 0x00, 0x01, 0x02, 0x04, 0x00, 0x20, 0x54, 0x54, 0x54, 0x78,
  0x7f, 0x48, 0x44, 0x44, 0x38, 0x38, 0x44, 0x44, 0x44, 0x20, 0x38, 0x44, 0x44, 0x48, 0x7f,
  0x38, 0x54, 0x54, 0x54, 0x18, 0x08, 0x7e, 0x09, 0x01, 0x02, 0x0c, 0x52, 0x52, 0x52, 0x3e,
  0x7f, 0x08, 0x04, 0x04, 0x78, 0x00, 0x44, 0x7d, 0x40, 0x00, 0x20, 0x40, 0x44, 0x3d, 0x00,
  0x7f, 0x10, 0x28, 0x44, 0x00, 0x00, 0x41, 0x7f, 0x40, 0x00, 0x7c, 0x04, 0x18, 0x04, 0x78,
  0x7c, 0x08, 0x04, 0x04, 0x78, 0x38, 0x44, 0x44, 0x44, 0x38, 0x7c, 0x14, 0x14, 0x14, 0x08,
  0x08, 0x14, 0x14, 0x18, 0x7c, 0x7c, 0x08, 0x04, 0x04, 0x08, 0x48, 0x54, 0x54, 0x54, 0x20,
  0x04, 0x3f, 0x44, 0x40, 0x20, 0x3c, 0x40, 0x40, 0x20, 0x7c, 0x1c, 0x20, 0x40, 0x20, 0x1c,
  0x3c, 0x40, 0x30, 0x40, 0x3c, 0x44, 0x28, 0x10, 0x28, 0x44, 0x0c, 0x50, 0x50, 0x50, 0x3c,
  0x44, 0x64, 0x54, 0x4c, 0x44, 0x00, 0x08, 0x36, 0x41, 0x00, 0x00, 0x00, 0x7f, 0x00, 0x00,
  0x00, 0x41, 0x36, 0x08, 0x00, 0x10, 0x08, 0x08, 0x10, 0x08,
];
