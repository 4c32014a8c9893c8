// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/output.rs - 呈现输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::FromUrl;
#[cfg(feature = "directory_record")]
use crate::FromUrlWithScheme;
use crate::task::AnalysisResult;

/// 呈现端收的是三类文本：状态、结果（含置信度）与最佳着法
pub trait Present {
  fn show_status(&self, status: &str);
  fn show_result(&self, result: &AnalysisResult, best_move: Option<&str>);
}

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 以日志形式呈现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresent;

const TRACING_SCHEME: &str = "log";

impl Present for TracingPresent {
  fn show_status(&self, status: &str) {
    info!("状态: {}", status);
  }

  fn show_result(&self, result: &AnalysisResult, best_move: Option<&str>) {
    if result.board_found {
      info!(
        "FEN: {} (置信度 {:.1}%, {} 个棋子, 耗时 {:.2?})",
        result.fen,
        result.confidence * 100.0,
        result.piece_count,
        result.elapsed
      );
    } else {
      info!("未发现棋盘 (耗时 {:.2?})", result.elapsed);
    }
    match best_move {
      Some(best) => info!("最佳着法: {}", best),
      None => info!("本轮没有着法建议"),
    }
  }
}

pub enum OutputWrapper {
  Tracing(TracingPresent),
  #[cfg(feature = "directory_record")]
  DirectoryRecord(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == TRACING_SCHEME {
      return Ok(OutputWrapper::Tracing(TracingPresent));
    }
    #[cfg(feature = "directory_record")]
    {
      if url.scheme() == DirectoryRecordOutput::SCHEME {
        let output = DirectoryRecordOutput::from_url(url)?;
        return Ok(OutputWrapper::DirectoryRecord(output));
      }
    }
    Err(OutputError::SchemeMismatch)
  }
}

impl Present for OutputWrapper {
  fn show_status(&self, status: &str) {
    match self {
      OutputWrapper::Tracing(output) => output.show_status(status),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecord(output) => output.show_status(status),
    }
  }

  fn show_result(&self, result: &AnalysisResult, best_move: Option<&str>) {
    match self {
      OutputWrapper::Tracing(output) => output.show_result(result, best_move),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecord(output) => output.show_result(result, best_move),
    }
  }
}
