// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/engine.rs - UCI 引擎子进程客户端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

/// 发送 `go movetime` 时的默认思考时间
pub const DEFAULT_MOVETIME: Duration = Duration::from_millis(1000);
/// 等待 `bestmove` 行的默认墙钟上限（思考时间加裕量）
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(3000);
/// 启动握手等待 `uciok` 的上限
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);
/// `quit` 之后等待进程退出的上限
const QUIT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum UciEngineError {
  #[error("引擎启动失败: {0}")]
  Spawn(std::io::Error),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("引擎输出流已关闭")]
  Closed,
  #[error("等待 {0} 超时 ({1:?})")]
  Timeout(&'static str, Duration),
  #[error("bestmove 行格式错误: {0}")]
  MalformedReply(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 持久的 UCI 引擎子进程。
/// 读写通道对没有内部同步，并发查询的正确性完全依赖
/// 调度器的单在飞不变式对所有调用的串行化。
pub struct UciEngine {
  child: Child,
  stdin: BufWriter<ChildStdin>,
  lines: Receiver<String>,
  reader: Option<JoinHandle<()>>,
  stopped: bool,
}

const UCI_SCHEME: &str = "uci";

impl FromUrlWithScheme for UciEngine {
  const SCHEME: &'static str = UCI_SCHEME;
}

impl FromUrl for UciEngine {
  type Error = UciEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != UCI_SCHEME {
      return Err(UciEngineError::SchemeMismatch);
    }
    UciEngine::spawn(Path::new(url.path()))
  }
}

impl UciEngine {
  /// 从文件系统路径启动引擎
  pub fn spawn(path: &Path) -> Result<Self, UciEngineError> {
    info!("启动引擎: {}", path.display());
    UciEngine::spawn_command(Command::new(path))
  }

  /// 从已配置的命令启动引擎，测试用桩进程也走这里
  pub fn spawn_command(mut command: Command) -> Result<Self, UciEngineError> {
    let mut child = command
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .spawn()
      .map_err(UciEngineError::Spawn)?;

    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| UciEngineError::Spawn(std::io::Error::other("无法取得引擎标准输入")))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| UciEngineError::Spawn(std::io::Error::other("无法取得引擎标准输出")))?;

    let (tx, rx) = mpsc::channel();
    let reader = thread::Builder::new()
      .name("uci-reader".to_string())
      .spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
          match line {
            Ok(line) => {
              if tx.send(line).is_err() {
                break;
              }
            }
            Err(e) => {
              debug!("读取引擎输出失败: {}", e);
              break;
            }
          }
        }
        debug!("引擎读取线程退出");
      })?;

    let mut engine = UciEngine {
      child,
      stdin: BufWriter::new(stdin),
      lines: rx,
      reader: Some(reader),
      stopped: false,
    };

    engine.send_command("uci")?;
    match engine.wait_for("uciok", HANDSHAKE_TIMEOUT) {
      Ok(_) => debug!("引擎握手完成"),
      // 未按 UCI 应答也继续使用，查询阶段自有超时兜底
      Err(UciEngineError::Timeout(..)) => warn!("引擎未在 {:?} 内应答 uciok", HANDSHAKE_TIMEOUT),
      Err(e) => return Err(e),
    }

    Ok(engine)
  }

  /// 写一行命令并刷新
  pub fn send_command(&mut self, line: &str) -> Result<(), UciEngineError> {
    debug!("发送引擎命令: {}", line);
    writeln!(self.stdin, "{}", line)?;
    self.stdin.flush()?;
    Ok(())
  }

  /// 查询给定局面的最佳着法。
  /// 在墙钟上限内读行直到出现 `bestmove`，取第二个空白分隔词；
  /// 超时与流关闭是不同的错误种类，恰好返回一次结果或错误。
  pub fn best_move(
    &mut self,
    fen: &str,
    movetime: Duration,
    reply_timeout: Duration,
  ) -> Result<String, UciEngineError> {
    // 丢弃上一轮查询可能残留的输出行
    while let Ok(stale) = self.lines.try_recv() {
      debug!("丢弃残留引擎输出: {}", stale);
    }

    self.send_command(&format!("position fen {}", fen))?;
    self.send_command(&format!("go movetime {}", movetime.as_millis()))?;

    let line = self.wait_for("bestmove", reply_timeout)?;
    let best = line
      .split_whitespace()
      .nth(1)
      .ok_or_else(|| UciEngineError::MalformedReply(line.clone()))?;
    debug!("引擎给出着法: {}", best);
    Ok(best.to_string())
  }

  /// 在截止时间前读行，返回第一条以 `prefix` 开头的
  fn wait_for(&mut self, prefix: &'static str, timeout: Duration) -> Result<String, UciEngineError> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(UciEngineError::Timeout(prefix, timeout))?;
      match self.lines.recv_timeout(remaining) {
        Ok(line) => {
          if line.starts_with(prefix) {
            return Ok(line);
          }
          debug!("引擎输出: {}", line);
        }
        Err(RecvTimeoutError::Timeout) => return Err(UciEngineError::Timeout(prefix, timeout)),
        Err(RecvTimeoutError::Disconnected) => return Err(UciEngineError::Closed),
      }
    }
  }

  /// 发送 `quit` 并在限期内等待退出，逾期强制终止；回收读取线程
  pub fn quit(&mut self) -> Result<(), UciEngineError> {
    if self.stopped {
      return Ok(());
    }
    self.stopped = true;

    if let Err(e) = self.send_command("quit") {
      debug!("发送 quit 失败: {}", e);
    }

    let deadline = Instant::now() + QUIT_TIMEOUT;
    loop {
      match self.child.try_wait()? {
        Some(status) => {
          debug!("引擎退出: {}", status);
          break;
        }
        None => {
          if Instant::now() >= deadline {
            warn!("引擎未在 {:?} 内退出，强制终止", QUIT_TIMEOUT);
            self.child.kill()?;
            self.child.wait()?;
            break;
          }
          thread::sleep(Duration::from_millis(10));
        }
      }
    }

    if let Some(handle) = self.reader.take() {
      let _ = handle.join();
    }
    Ok(())
  }
}

impl Drop for UciEngine {
  fn drop(&mut self) {
    if !self.stopped
      && let Err(e) = self.quit()
    {
      debug!("关闭引擎失败: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 用 sh 脚本冒充引擎
  fn stub(script: &str) -> Result<UciEngine, UciEngineError> {
    let mut command = Command::new("sh");
    command.args(["-c", script]);
    UciEngine::spawn_command(command)
  }

  const RESPONSIVE: &str = r#"
    while read line; do
      case "$line" in
        uci) echo uciok ;;
        go*) echo "bestmove e2e4" ;;
        quit) exit 0 ;;
      esac
    done
  "#;

  const PONDERING: &str = r#"
    while read line; do
      case "$line" in
        uci) echo uciok ;;
        go*) echo "bestmove e7e5 ponder e2e4" ;;
        quit) exit 0 ;;
      esac
    done
  "#;

  const SILENT: &str = r#"
    while read line; do
      case "$line" in
        uci) echo uciok ;;
        quit) exit 0 ;;
      esac
    done
  "#;

  #[test]
  fn best_move_round_trip() {
    let mut engine = stub(RESPONSIVE).unwrap();
    let best = engine
      .best_move(
        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
        Duration::from_millis(50),
        Duration::from_millis(2000),
      )
      .unwrap();
    assert_eq!(best, "e2e4");
    engine.quit().unwrap();
  }

  #[test]
  fn ponder_suffix_is_ignored() {
    let mut engine = stub(PONDERING).unwrap();
    let best = engine
      .best_move(
        "8/8/8/8/8/8/8/8 w - - 0 1",
        Duration::from_millis(50),
        Duration::from_millis(2000),
      )
      .unwrap();
    assert_eq!(best, "e7e5");
    engine.quit().unwrap();
  }

  #[test]
  fn missing_bestmove_times_out() {
    let mut engine = stub(SILENT).unwrap();
    let result = engine.best_move(
      "8/8/8/8/8/8/8/8 w - - 0 1",
      Duration::from_millis(10),
      Duration::from_millis(200),
    );
    assert!(matches!(result, Err(UciEngineError::Timeout(..))));
    engine.quit().unwrap();
  }

  #[test]
  fn dead_subprocess_yields_error_not_hang() {
    let mut engine = stub("echo uciok; exit 0").unwrap();
    // 让进程先退出
    thread::sleep(Duration::from_millis(50));
    let result = engine.best_move(
      "8/8/8/8/8/8/8/8 w - - 0 1",
      Duration::from_millis(10),
      Duration::from_millis(200),
    );
    assert!(result.is_err());
  }

  #[test]
  fn repeated_queries_reuse_the_session() {
    let mut engine = stub(RESPONSIVE).unwrap();
    for _ in 0..3 {
      let best = engine
        .best_move(
          "8/8/8/8/8/8/8/8 w - - 0 1",
          Duration::from_millis(10),
          Duration::from_millis(2000),
        )
        .unwrap();
      assert_eq!(best, "e2e4");
    }
    engine.quit().unwrap();
  }

  #[test]
  fn quit_is_idempotent() {
    let mut engine = stub(RESPONSIVE).unwrap();
    engine.quit().unwrap();
    engine.quit().unwrap();
  }
}
