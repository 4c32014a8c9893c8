// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use guanqi::{
  FromUrl,
  board::BoardMapper,
  engine::UciEngine,
  input::ImageFileInput,
  model::ChessYoloBuilder,
  output::OutputWrapper,
  task::{AnalysisScheduler, ChessPipeline},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("引擎路径: {}", args.engine);
  info!("输入来源: {}", args.input);
  info!("呈现输出: {}", args.output);
  info!("置信度阈值: {}", args.confidence);
  info!("NMS 阈值: {}", args.nms_threshold);
  info!("分析间隔: {}ms, 思考时间: {}ms", args.throttle, args.movetime);

  guanqi::model::initialize()?;

  info!("正在加载模型...");
  let detector = ChessYoloBuilder::from_url(&args.model)?
    .confidence_threshold(args.confidence)
    .iou_threshold(args.nms_threshold)
    .build()?;

  info!("正在启动引擎...");
  let engine = UciEngine::from_url(&args.engine)?;

  let mapper = BoardMapper::new(args.tie_break);
  let pipeline = ChessPipeline::new(detector, mapper, engine)
    .with_movetime(Duration::from_millis(args.movetime));
  let sink = OutputWrapper::from_url(&args.output)?;
  let scheduler = AnalysisScheduler::new(pipeline, sink, Duration::from_millis(args.throttle));

  let input = ImageFileInput::from_url(&args.input)?;

  let (tx, rx) = std::sync::mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .expect("Error setting Ctrl-C handler");

  info!("开始处理...");
  let mut offered = 0u64;
  let mut admitted = 0u64;

  for frame in input {
    offered += 1;
    if scheduler.offer(frame) {
      admitted += 1;
    }
    if args.max_frames > 0 && offered >= args.max_frames {
      info!("达到指定帧数 {}, 退出任务循环", offered);
      break;
    }
    if rx.try_recv().is_ok() {
      warn!("中断信号接收，退出任务循环");
      break;
    }
    if args.interval > 0 {
      thread::sleep(Duration::from_millis(args.interval));
    }
  }

  scheduler.shutdown();
  info!("任务完成，共 {} 帧，接纳 {} 次分析", offered, admitted);

  Ok(())
}
