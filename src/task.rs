// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/task.rs - 分析流水线与节流调度
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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::board::BoardMapper;
use crate::engine::{DEFAULT_MOVETIME, DEFAULT_REPLY_TIMEOUT, UciEngine};
use crate::fen::{self, EMPTY_BOARD_FEN};
use crate::frame::Frame;
use crate::model::{DetectResult, Model};
use crate::output::Present;

/// 两次分析之间的最小间隔
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(2500);

/// 一轮完整分析的产出
#[derive(Debug, Clone)]
pub struct AnalysisResult {
  pub fen: String,
  /// 所有检测的平均置信度，位于 [0,1]
  pub confidence: f32,
  pub piece_count: usize,
  pub board_found: bool,
  pub elapsed: Duration,
}

impl AnalysisResult {
  /// 零检测时的固定空盘结果
  pub fn empty(elapsed: Duration) -> Self {
    AnalysisResult {
      fen: EMPTY_BOARD_FEN.to_string(),
      confidence: 0.0,
      piece_count: 0,
      board_found: false,
      elapsed,
    }
  }
}

/// 一帧进、一份结果出的分析流水线
pub trait Pipeline {
  fn analyze(&mut self, frame: Frame) -> anyhow::Result<(AnalysisResult, Option<String>)>;

  /// 释放模型与引擎资源；默认什么都不做
  fn shutdown(&mut self) {}
}

/// 生产流水线：检测 → 棋盘映射 → FEN → 引擎查询。
/// 对检测模型做泛型，便于用桩模型测试调度性质。
pub struct ChessPipeline<M> {
  detector: M,
  mapper: BoardMapper,
  engine: UciEngine,
  movetime: Duration,
  reply_timeout: Duration,
}

impl<M> ChessPipeline<M>
where
  M: Model<Input = Frame, Output = DetectResult>,
{
  pub fn new(detector: M, mapper: BoardMapper, engine: UciEngine) -> Self {
    ChessPipeline {
      detector,
      mapper,
      engine,
      movetime: DEFAULT_MOVETIME,
      reply_timeout: DEFAULT_REPLY_TIMEOUT,
    }
  }

  pub fn with_movetime(mut self, movetime: Duration) -> Self {
    self.movetime = movetime;
    self
  }

  pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
    self.reply_timeout = reply_timeout;
    self
  }
}

impl<M> Pipeline for ChessPipeline<M>
where
  M: Model<Input = Frame, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  fn analyze(&mut self, frame: Frame) -> anyhow::Result<(AnalysisResult, Option<String>)> {
    let start = Instant::now();

    // 推理失败退化为零检测，本轮以"未发现棋盘"收场
    let mut detections = match self.detector.infer(&frame) {
      Ok(result) => result,
      Err(e) => {
        error!("推理失败: {}", e);
        DetectResult::default()
      }
    };

    if detections.is_empty() {
      info!("第 {} 帧未检测到棋子", frame.index);
      return Ok((AnalysisResult::empty(start.elapsed()), None));
    }

    let board = self.mapper.map(&mut detections);
    let fen = fen::synthesize(&board);
    debug!("合成 FEN: {}", fen);

    let best = self.engine.best_move(&fen, self.movetime, self.reply_timeout)?;

    let result = AnalysisResult {
      fen,
      confidence: detections.mean_score(),
      piece_count: detections.len(),
      board_found: true,
      elapsed: start.elapsed(),
    };
    Ok((result, Some(best)))
  }

  fn shutdown(&mut self) {
    if let Err(e) = self.engine.quit() {
      warn!("关闭引擎失败: {}", e);
    }
  }
}

/// 准入状态，帧到达与完成回调两侧都会读写，必须在同一把锁下检查并置位
struct Admission {
  last_start: Option<Instant>,
  in_flight: bool,
}

/// 析构时清除在飞标志；无论工作线程正常返回、出错还是恐慌都会执行
struct InFlightGuard {
  admission: Arc<Mutex<Admission>>,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    lock_or_recover(&self.admission).in_flight = false;
  }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// 节流的单在飞调度器。
/// 帧到达时原子地检查准入：距上次启动不足间隔、或仍有分析在飞，
/// 该帧直接丢弃，不排队不积压。引擎通道与模型会话都未做内部同步，
/// 这里的单在飞保证是它们安全的全部前提。
pub struct AnalysisScheduler<P, S> {
  pipeline: Arc<Mutex<P>>,
  sink: Arc<S>,
  throttle: Duration,
  admission: Arc<Mutex<Admission>>,
  accepting: Arc<AtomicBool>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P, S> AnalysisScheduler<P, S>
where
  P: Pipeline + Send + 'static,
  S: Present + Send + Sync + 'static,
{
  pub fn new(pipeline: P, sink: S, throttle: Duration) -> Self {
    AnalysisScheduler {
      pipeline: Arc::new(Mutex::new(pipeline)),
      sink: Arc::new(sink),
      throttle,
      admission: Arc::new(Mutex::new(Admission {
        last_start: None,
        in_flight: false,
      })),
      accepting: Arc::new(AtomicBool::new(true)),
      worker: Mutex::new(None),
    }
  }

  pub fn throttle(&self) -> Duration {
    self.throttle
  }

  pub fn in_flight(&self) -> bool {
    lock_or_recover(&self.admission).in_flight
  }

  /// 提交一帧。通过准入检查则派发一次异步分析并返回 true，
  /// 否则丢帧返回 false。
  pub fn offer(&self, frame: Frame) -> bool {
    if !self.accepting.load(Ordering::Acquire) {
      debug!("调度器已停机，丢弃第 {} 帧", frame.index);
      return false;
    }

    {
      let mut admission = lock_or_recover(&self.admission);
      if admission.in_flight {
        debug!("丢弃第 {} 帧：上一轮分析仍在进行", frame.index);
        return false;
      }
      if let Some(last) = admission.last_start
        && last.elapsed() < self.throttle
      {
        debug!("丢弃第 {} 帧：距上次分析不足 {:?}", frame.index, self.throttle);
        return false;
      }
      admission.in_flight = true;
      admission.last_start = Some(Instant::now());
    }

    let guard = InFlightGuard {
      admission: Arc::clone(&self.admission),
    };
    let pipeline = Arc::clone(&self.pipeline);
    let sink = Arc::clone(&self.sink);
    let index = frame.index;

    let handle = thread::spawn(move || {
      let _guard = guard;
      sink.show_status("分析中…");
      // 单在飞不变式保证此锁不会竞争
      let outcome = lock_or_recover(&pipeline).analyze(frame);
      match outcome {
        Ok((result, best)) => sink.show_result(&result, best.as_deref()),
        Err(e) => {
          error!("第 {} 帧分析失败: {:#}", index, e);
          sink.show_status("分析失败");
        }
      }
    });

    // 上一个工作线程此刻必然已进入收尾，回收其句柄
    if let Some(previous) = lock_or_recover(&self.worker).replace(handle) {
      let _ = previous.join();
    }
    true
  }

  /// 停止接收新帧，等待在飞分析结束（引擎等待有界，等待必然有限），
  /// 然后释放流水线资源。
  pub fn shutdown(&self) {
    self.accepting.store(false, Ordering::Release);

    if let Some(handle) = lock_or_recover(&self.worker).take() {
      info!("等待进行中的分析结束");
      let _ = handle.join();
    }

    lock_or_recover(&self.pipeline).shutdown();
    info!("调度器已停机");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::process::Command;
  use std::sync::atomic::AtomicUsize;

  use image::RgbImage;

  use crate::model::{BoundingBox, Detection, PieceKind};

  fn frame(index: u64) -> Frame {
    Frame::new(RgbImage::new(4, 4), index, index * 33)
  }

  /// 用 sh 脚本冒充引擎
  fn stub_engine() -> UciEngine {
    let script = r#"
      while read line; do
        case "$line" in
          uci) echo uciok ;;
          go*) echo "bestmove e2e4" ;;
          quit) exit 0 ;;
        esac
      done
    "#;
    let mut command = Command::new("sh");
    command.args(["-c", script]);
    UciEngine::spawn_command(command).unwrap()
  }

  /// 固定输出的桩检测模型
  struct StubDetector {
    items: Vec<Detection>,
  }

  impl Model for StubDetector {
    type Input = Frame;
    type Output = DetectResult;
    type Error = std::io::Error;

    fn infer(&self, _input: &Frame) -> Result<DetectResult, std::io::Error> {
      Ok(DetectResult {
        items: self.items.clone(),
      })
    }
  }

  /// 必然失败的桩检测模型
  struct BrokenDetector;

  impl Model for BrokenDetector {
    type Input = Frame;
    type Output = DetectResult;
    type Error = std::io::Error;

    fn infer(&self, _input: &Frame) -> Result<DetectResult, std::io::Error> {
      Err(std::io::Error::other("桩模型故障"))
    }
  }

  /// 按开局摆法生成一份检测列表
  fn start_position_items() -> Vec<Detection> {
    let placement = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR";
    let mut items = Vec::new();
    for (row, rank) in placement.split('/').enumerate() {
      let mut col = 0usize;
      for c in rank.chars() {
        if let Some(digit) = c.to_digit(10) {
          col += digit as usize;
          continue;
        }
        let kind = PieceKind::from_fen_char(c).unwrap();
        let cx = (col as f32 + 0.5) / 8.0;
        let cy = (row as f32 + 0.5) / 8.0;
        items.push(Detection {
          kind,
          score: 0.9,
          bbox: BoundingBox::from_center(cx, cy, 0.08, 0.08),
          square: None,
        });
        col += 1;
      }
    }
    items
  }

  #[test]
  fn pipeline_start_position_end_to_end() {
    let detector = StubDetector {
      items: start_position_items(),
    };
    let mut pipeline = ChessPipeline::new(detector, BoardMapper::default(), stub_engine())
      .with_movetime(Duration::from_millis(10))
      .with_reply_timeout(Duration::from_millis(2000));

    let (result, best) = pipeline.analyze(frame(0)).unwrap();
    assert!(result.board_found);
    assert_eq!(
      result.fen,
      "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"
    );
    assert_eq!(result.piece_count, 32);
    assert!((result.confidence - 0.9).abs() < 1e-5);
    assert_eq!(best.as_deref(), Some("e2e4"));
    pipeline.shutdown();
  }

  #[test]
  fn pipeline_short_circuits_on_zero_detections() {
    let detector = StubDetector { items: Vec::new() };
    let mut pipeline = ChessPipeline::new(detector, BoardMapper::default(), stub_engine());

    let (result, best) = pipeline.analyze(frame(0)).unwrap();
    assert!(!result.board_found);
    assert_eq!(result.fen, EMPTY_BOARD_FEN);
    assert_eq!(result.piece_count, 0);
    assert_eq!(result.confidence, 0.0);
    assert!(best.is_none());
    pipeline.shutdown();
  }

  #[test]
  fn pipeline_degrades_on_detector_failure() {
    let mut pipeline = ChessPipeline::new(BrokenDetector, BoardMapper::default(), stub_engine());

    let (result, best) = pipeline.analyze(frame(0)).unwrap();
    assert!(!result.board_found);
    assert_eq!(result.fen, EMPTY_BOARD_FEN);
    assert!(best.is_none());
    pipeline.shutdown();
  }

  /// 固定延迟的桩流水线
  struct StubPipeline {
    delay: Duration,
    calls: Arc<AtomicUsize>,
    fail: bool,
  }

  impl Pipeline for StubPipeline {
    fn analyze(&mut self, _frame: Frame) -> anyhow::Result<(AnalysisResult, Option<String>)> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      thread::sleep(self.delay);
      if self.fail {
        anyhow::bail!("桩流水线故障");
      }
      Ok((AnalysisResult::empty(self.delay), None))
    }
  }

  #[derive(Default)]
  struct CountingSink {
    results: AtomicUsize,
    statuses: AtomicUsize,
  }

  impl Present for CountingSink {
    fn show_status(&self, _status: &str) {
      self.statuses.fetch_add(1, Ordering::SeqCst);
    }

    fn show_result(&self, _result: &AnalysisResult, _best_move: Option<&str>) {
      self.results.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn scheduler(
    delay: Duration,
    throttle: Duration,
    fail: bool,
  ) -> (AnalysisScheduler<StubPipeline, CountingSink>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = StubPipeline {
      delay,
      calls: Arc::clone(&calls),
      fail,
    };
    (
      AnalysisScheduler::new(pipeline, CountingSink::default(), throttle),
      calls,
    )
  }

  #[test]
  fn burst_admits_exactly_one_while_in_flight() {
    let (scheduler, calls) = scheduler(Duration::from_millis(800), Duration::ZERO, false);
    let scheduler = Arc::new(scheduler);

    let mut handles = Vec::new();
    for t in 0..8 {
      let scheduler = Arc::clone(&scheduler);
      handles.push(thread::spawn(move || {
        let mut admitted = 0usize;
        for i in 0..20 {
          if scheduler.offer(frame(t * 100 + i)) {
            admitted += 1;
          }
          thread::sleep(Duration::from_millis(5));
        }
        admitted
      }));
    }
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // 800ms 在飞期间的所有并发提交只有第一帧被接纳
    assert_eq!(admitted, 1);
    scheduler.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn throughput_is_bounded_by_throttle() {
    let throttle = Duration::from_millis(100);
    let (scheduler, _calls) = scheduler(Duration::from_millis(1), throttle, false);

    let window = Duration::from_millis(450);
    let start = Instant::now();
    let mut admitted = 0usize;
    while start.elapsed() < window {
      if scheduler.offer(frame(0)) {
        admitted += 1;
      }
      thread::sleep(Duration::from_millis(5));
    }
    scheduler.shutdown();

    // 持续 D、节流 T 时接纳次数 ≤ floor(D/T) + 1
    let bound = (window.as_millis() / throttle.as_millis()) as usize + 1;
    assert!(admitted <= bound, "接纳 {} 次，超过上界 {}", admitted, bound);
    assert!(admitted >= 1);
  }

  #[test]
  fn frames_are_dropped_not_queued() {
    let (scheduler, calls) = scheduler(Duration::from_millis(50), Duration::from_millis(3_600_000), false);

    assert!(scheduler.offer(frame(0)));
    // 节流窗口内的后续帧全部丢弃，不会补跑
    for i in 1..10 {
      assert!(!scheduler.offer(frame(i)));
    }
    thread::sleep(Duration::from_millis(150));
    assert!(!scheduler.offer(frame(10)));
    scheduler.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn in_flight_clears_after_error() {
    let (scheduler, calls) = scheduler(Duration::from_millis(10), Duration::ZERO, true);

    assert!(scheduler.offer(frame(0)));
    thread::sleep(Duration::from_millis(100));
    assert!(!scheduler.in_flight());
    // 失败之后照样接纳下一帧
    assert!(scheduler.offer(frame(1)));
    thread::sleep(Duration::from_millis(100));
    scheduler.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn shutdown_refuses_new_frames() {
    let (scheduler, calls) = scheduler(Duration::from_millis(1), Duration::ZERO, false);
    scheduler.shutdown();
    assert!(!scheduler.offer(frame(0)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn sink_sees_result_of_completed_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = StubPipeline {
      delay: Duration::from_millis(5),
      calls: Arc::clone(&calls),
      fail: false,
    };
    let scheduler = AnalysisScheduler::new(pipeline, CountingSink::default(), Duration::ZERO);

    assert!(scheduler.offer(frame(0)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(scheduler.sink.results.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.sink.statuses.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
  }
}
