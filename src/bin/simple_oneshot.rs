// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧分析测试代码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use guanqi::{
  FromUrl,
  board::{BoardMapper, TieBreak},
  engine::UciEngine,
  input::ImageFileInput,
  model::ChessYoloBuilder,
  task::{ChessPipeline, Pipeline},
};

/// Guanqi 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型路径
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// UCI 引擎路径
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,

  /// 输入图像
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 同格冲突策略 (processing-order / highest-confidence)
  #[arg(long, default_value = "processing-order", value_name = "POLICY")]
  pub tie_break: TieBreak,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("引擎路径: {}", args.engine);
  info!("输入来源: {}", args.input);

  guanqi::model::initialize()?;

  let detector = ChessYoloBuilder::from_url(&args.model)?.build()?;
  let engine = UciEngine::from_url(&args.engine)?;
  let mut pipeline = ChessPipeline::new(detector, BoardMapper::new(args.tie_break), engine);

  let mut input = ImageFileInput::from_url(&args.input)?;
  let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;

  info!("开始分析...");
  let (result, best_move) = pipeline.analyze(frame)?;

  if result.board_found {
    info!("FEN: {}", result.fen);
    info!(
      "置信度 {:.1}%, {} 个棋子, 耗时 {:.2?}",
      result.confidence * 100.0,
      result.piece_count,
      result.elapsed
    );
  } else {
    info!("未发现棋盘");
  }
  match best_move.as_deref() {
    Some(best) => info!("最佳着法: {}", best),
    None => info!("本轮没有着法建议"),
  }

  pipeline.shutdown();
  Ok(())
}
