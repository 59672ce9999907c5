// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, input::Request};

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemaMismatch(String),
  #[error("I/O 错误 {path}: {source}")]
  IoError {
    path: PathBuf,
    source: std::io::Error,
  },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ImageFileInputError + '_ {
  move |source| ImageFileInputError::IoError {
    path: path.to_path_buf(),
    source,
  }
}

fn request_id(path: &Path) -> String {
  path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.display().to_string())
}

fn check_scheme(url: &Url, expected: &str) -> Result<(), ImageFileInputError> {
  if url.scheme() != expected {
    error!(
      "URI 方案不匹配: 期望 '{}', 实际 '{}'",
      expected,
      url.scheme()
    );
    return Err(ImageFileInputError::SchemaMismatch(url.scheme().to_string()));
  }
  Ok(())
}

/// `image:///path/photo.jpg`：单个请求，请求 ID 为文件名（不含扩展名）
pub struct ImageFileInput {
  request: Option<Request>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;

    let path = PathBuf::from(url.path());
    let bytes = std::fs::read(&path).map_err(io_error(&path))?;
    info!("读取图像文件: {} ({} 字节)", path.display(), bytes.len());

    Ok(ImageFileInput {
      request: Some(Request::new(request_id(&path), bytes)),
    })
  }
}

impl Iterator for ImageFileInput {
  type Item = Request;

  fn next(&mut self) -> Option<Self::Item> {
    self.request.take()
  }
}

/// `folder:///dir`：目录中每个图像文件一个请求，按文件名排序
pub struct DirectoryInput {
  files: std::vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;

    let directory = PathBuf::from(url.path());
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory).map_err(io_error(&directory))? {
      let path = entry.map_err(io_error(&directory))?.path();
      if path.is_file() && has_image_extension(&path) {
        files.push(path);
      }
    }
    files.sort();
    info!("输入目录 {} 共 {} 个图像文件", directory.display(), files.len());

    Ok(DirectoryInput {
      files: files.into_iter(),
    })
  }
}

fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

impl Iterator for DirectoryInput {
  type Item = Request;

  fn next(&mut self) -> Option<Self::Item> {
    // 读取失败的文件跳过
    for path in self.files.by_ref() {
      match std::fs::read(&path) {
        Ok(bytes) => return Some(Request::new(request_id(&path), bytes)),
        Err(e) => warn!("无法读取 {}: {}，跳过", path.display(), e),
      }
    }
    None
  }
}
