// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::{debug, error};

use crate::output::Present;
use crate::task::AnalysisResult;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 把每轮分析结果记录为按日期分目录的 JSON 文件。
/// `folder:///path?always` 连同"未发现棋盘"的轮次一并记录。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counters: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = url.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url.path()),
      frame_counters: Mutex::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn record_id(&self) -> u16 {
    let mut counter = match self.frame_counters.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  fn record_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.json",
      now.format("%H-%M-%S"),
      self.record_id()
    )))
  }

  fn record(
    &self,
    result: &AnalysisResult,
    best_move: Option<&str>,
  ) -> Result<(), DirectoryRecordOutputError> {
    let path = self.record_path()?;
    let payload = serde_json::json!({
      "recorded_at": Utc::now().to_rfc3339(),
      "fen": result.fen,
      "confidence": result.confidence,
      "piece_count": result.piece_count,
      "board_found": result.board_found,
      "elapsed_ms": result.elapsed.as_millis() as u64,
      "best_move": best_move,
    });
    std::fs::write(&path, payload.to_string())?;
    debug!("分析记录已写入 {}", path.display());
    Ok(())
  }
}

impl Present for DirectoryRecordOutput {
  fn show_status(&self, status: &str) {
    debug!("状态: {}", status);
  }

  fn show_result(&self, result: &AnalysisResult, best_move: Option<&str>) {
    if !self.always && !result.board_found {
      return;
    }
    if let Err(e) = self.record(result, best_move) {
      error!("写入分析记录失败: {}", e);
    }
  }
}
