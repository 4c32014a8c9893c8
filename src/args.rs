// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use url::Url;

use guanqi::board::TieBreak;

/// Guanqi 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型路径 (yolo11:///path/to/model.onnx)
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// UCI 引擎路径 (uci:///usr/bin/stockfish)
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,

  /// 帧来源（单个图像文件或目录）
  /// 例如 image:///captures/board.png 或 image:///captures/
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 呈现输出 (log:// 或 folder:///path/to/records)
  #[arg(long, default_value = "log://", value_name = "OUTPUT")]
  pub output: Url,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 两次分析的最小间隔（毫秒）
  #[arg(long, default_value = "2500", value_name = "MS")]
  pub throttle: u64,

  /// 引擎思考时间（毫秒）
  #[arg(long, default_value = "1000", value_name = "MS")]
  pub movetime: u64,

  /// 帧间隔（毫秒），模拟屏幕采集节奏
  #[arg(long, default_value = "200", value_name = "MS")]
  pub interval: u64,

  /// 同格冲突策略 (processing-order / highest-confidence)
  #[arg(long, default_value = "processing-order", value_name = "POLICY")]
  pub tie_break: TieBreak,

  /// 最大处理帧数（0 表示无限制）
  #[arg(long, default_value = "0", value_name = "COUNT")]
  pub max_frames: u64,
}
