// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/input/read_image_file.rs - 图像文件帧来源
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::frame::Frame;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("路径下没有可读的图像: {0}")]
  NoImages(PathBuf),
}

const READ_IMAGE_FILE_SCHEME: &str = "image";
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// 以图像文件冒充屏幕帧来源。
/// 路径可以是单个文件，也可以是目录（按文件名排序依次回放）。
/// 解码失败的文件记日志后跳过，帧来源本就不保证每帧可用。
pub struct ImageFileInput {
  pending: VecDeque<PathBuf>,
  started: Instant,
  next_index: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI 方案不匹配: 预期 '{}', 实际 '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    ImageFileInput::from_path(Path::new(url.path()))
  }
}

fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      let ext = ext.to_ascii_lowercase();
      IMAGE_EXTENSIONS.contains(&ext.as_str())
    })
    .unwrap_or(false)
}

impl ImageFileInput {
  pub fn from_path(path: &Path) -> Result<Self, ImageFileInputError> {
    let mut files = Vec::new();

    if path.is_dir() {
      for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_file() && has_image_extension(&entry_path) {
          files.push(entry_path);
        }
      }
      files.sort();
    } else {
      files.push(path.to_path_buf());
    }

    if files.is_empty() {
      return Err(ImageFileInputError::NoImages(path.to_path_buf()));
    }
    debug!("帧来源就绪，共 {} 个图像文件", files.len());

    Ok(ImageFileInput {
      pending: files.into(),
      started: Instant::now(),
      next_index: 0,
    })
  }

  pub fn remaining(&self) -> usize {
    self.pending.len()
  }
}

impl Iterator for ImageFileInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(path) = self.pending.pop_front() {
      let decoded = match ImageReader::open(&path) {
        Ok(reader) => reader.decode(),
        Err(e) => {
          warn!("打开图像失败，跳过 {}: {}", path.display(), e);
          continue;
        }
      };
      match decoded {
        Ok(image) => {
          let index = self.next_index;
          self.next_index += 1;
          let timestamp_ms = self.started.elapsed().as_millis() as u64;
          debug!("读取第 {} 帧: {}", index, path.display());
          return Some(Frame::new(image.into(), index, timestamp_ms));
        }
        Err(e) => warn!("解码图像失败，跳过 {}: {}", path.display(), e),
      }
    }
    None
  }
}
