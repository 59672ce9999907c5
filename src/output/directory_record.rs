// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, input::Request, output::Render, pipeline::Reply};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每个请求写入 `<id>.jpg` 与 `<id>.txt`（说明文字），失败时写入 `<id>.error.txt`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
    })
  }
}

impl DirectoryRecordOutput {
  fn record_path(&self, id: &str, suffix: &str) -> Result<PathBuf, DirectoryRecordOutputError> {
    if !self.directory.exists() {
      std::fs::create_dir_all(&self.directory)?;
    }
    Ok(self.directory.join(format!("{}{}", id, suffix)))
  }
}

impl Render<Request, Reply> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, _frame: &Request, result: &Reply) -> Result<(), Self::Error> {
    let image_path = self.record_path(&result.request_id, ".jpg")?;
    std::fs::write(&image_path, &result.image)?;
    std::fs::write(
      self.record_path(&result.request_id, ".txt")?,
      &result.caption,
    )?;
    debug!("记录请求 {} 到 {}", result.request_id, image_path.display());
    Ok(())
  }

  fn render_failure(&self, frame: &Request, message: &str) -> Result<(), Self::Error> {
    let path = self.record_path(&frame.id, ".error.txt")?;
    std::fs::write(&path, message)?;
    warn!("请求 {} 失败，提示写入: {}", frame.id, path.display());
    Ok(())
  }
}
