// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/board.rs - 棋盘映射
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::model::{DetectResult, PieceKind};

pub const BOARD_SIZE: usize = 8;
/// 包络每侧的留白，占对应跨度的比例
pub const ENVELOPE_PADDING: f32 = 0.05;

/// 棋格坐标。行 0 = 第 8 横排（顶部），列 0 = a 线
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
  pub row: u8,
  pub col: u8,
}

impl Square {
  pub fn file(&self) -> char {
    (b'a' + self.col) as char
  }

  pub fn rank(&self) -> u8 {
    8 - self.row
  }
}

impl fmt::Display for Square {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", self.file(), self.rank())
  }
}

/// 8×8 棋盘矩阵，每格为可选棋子
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardMatrix {
  cells: [[Option<PieceKind>; BOARD_SIZE]; BOARD_SIZE],
}

impl BoardMatrix {
  pub fn get(&self, row: usize, col: usize) -> Option<PieceKind> {
    self.cells[row][col]
  }

  pub fn set(&mut self, row: usize, col: usize, piece: Option<PieceKind>) {
    self.cells[row][col] = piece;
  }

  pub fn is_empty(&self) -> bool {
    self
      .cells
      .iter()
      .all(|row| row.iter().all(|cell| cell.is_none()))
  }

  pub fn piece_count(&self) -> usize {
    self
      .cells
      .iter()
      .map(|row| row.iter().filter(|cell| cell.is_some()).count())
      .sum()
  }
}

/// 同格冲突的裁决策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
  /// 按处理顺序后写者胜（原始行为）
  #[default]
  ProcessingOrder,
  /// 置信度更高者胜
  HighestConfidence,
}

impl FromStr for TieBreak {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "processing-order" => Ok(TieBreak::ProcessingOrder),
      "highest-confidence" => Ok(TieBreak::HighestConfidence),
      other => Err(format!("未知的冲突策略: {}", other)),
    }
  }
}

/// 所有检测框的外包络，每侧加 5% 留白后裁剪到 [0,1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl Envelope {
  /// 检测列表为空时无包络
  pub fn around(result: &DetectResult) -> Option<Envelope> {
    let first = result.items.first()?;
    let mut left = first.bbox.left;
    let mut top = first.bbox.top;
    let mut right = first.bbox.right;
    let mut bottom = first.bbox.bottom;

    for det in &result.items[1..] {
      left = left.min(det.bbox.left);
      top = top.min(det.bbox.top);
      right = right.max(det.bbox.right);
      bottom = bottom.max(det.bbox.bottom);
    }

    let pad_x = (right - left) * ENVELOPE_PADDING;
    let pad_y = (bottom - top) * ENVELOPE_PADDING;

    Some(Envelope {
      left: (left - pad_x).clamp(0.0, 1.0),
      top: (top - pad_y).clamp(0.0, 1.0),
      right: (right + pad_x).clamp(0.0, 1.0),
      bottom: (bottom + pad_y).clamp(0.0, 1.0),
    })
  }

  /// 把图像坐标换算为包络内的相对坐标
  fn relative(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.left) / (self.right - self.left),
      (y - self.top) / (self.bottom - self.top),
    )
  }
}

/// 把检测结果映射到 8×8 棋盘。
/// 检测按置信度降序到达（NMS 之后的顺序），逐个落格。
#[derive(Debug, Clone, Copy, Default)]
pub struct BoardMapper {
  tie_break: TieBreak,
}

impl BoardMapper {
  pub fn new(tie_break: TieBreak) -> Self {
    BoardMapper { tie_break }
  }

  pub fn tie_break(&self) -> TieBreak {
    self.tie_break
  }

  /// 映射并回填每个检测的所在棋格。
  /// 图像宽高仅说明坐标已归一化，不参与计算。
  pub fn map(&self, result: &mut DetectResult) -> BoardMatrix {
    let mut board = BoardMatrix::default();
    let Some(envelope) = Envelope::around(result) else {
      return board;
    };
    debug!("棋盘包络: {:?}", envelope);

    // HighestConfidence 策略下记录每格已写入的置信度
    let mut occupant_score = [[f32::MIN; BOARD_SIZE]; BOARD_SIZE];

    for det in &mut result.items {
      let (cx, cy) = det.bbox.center();
      let (rel_x, rel_y) = envelope.relative(cx, cy);
      if !(0.0..=1.0).contains(&rel_x) || !(0.0..=1.0).contains(&rel_y) {
        debug!("检测中心落在包络之外，丢弃: {:?}", det.bbox);
        continue;
      }

      let col = ((rel_x * BOARD_SIZE as f32).floor() as i32).clamp(0, BOARD_SIZE as i32 - 1) as usize;
      let row = ((rel_y * BOARD_SIZE as f32).floor() as i32).clamp(0, BOARD_SIZE as i32 - 1) as usize;

      det.square = Some(Square {
        row: row as u8,
        col: col as u8,
      });

      let write = match self.tie_break {
        TieBreak::ProcessingOrder => true,
        TieBreak::HighestConfidence => det.score > occupant_score[row][col],
      };
      if write {
        if board.get(row, col).is_some() {
          debug!(
            "棋格 {} 冲突，按 {:?} 策略改写",
            Square {
              row: row as u8,
              col: col as u8
            },
            self.tie_break
          );
        }
        board.set(row, col, Some(det.kind));
        occupant_score[row][col] = det.score;
      }
    }

    board
  }
}
