// 该文件是 Guanqi （观棋不语） 项目的一部分。
// src/model/chess_yolo.rs - 棋子检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Mutex;

use image::RgbImage;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Value;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{BoundingBox, DEFAULT_LABELS, DetectResult, Detection, Model, PieceKind},
};

pub const CHESS_CLASS_NUM: usize = 12;
pub const CHESS_INPUT_EDGE: u32 = 640;
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const IOU_THRESHOLD: f32 = 0.45;
const RGB_CHANNELS: usize = 3;
// 每个候选行: cx, cy, w, h, objectness + 12 个类别分数
const CANDIDATE_STRIDE: usize = 5 + CHESS_CLASS_NUM;

#[derive(Error, Debug)]
pub enum ChessYoloError {
  #[error("运行时初始化失败: {0}")]
  RuntimeInit(String),
  #[error("模型加载错误: {0}")]
  ModelLoad(std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("标签数量错误: 预期 {expected} 个, 实际 {actual} 个")]
  LabelCount { expected: usize, actual: usize },
  #[error("ONNX Runtime 错误: {0}")]
  Ort(ort::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl From<std::io::Error> for ChessYoloError {
  fn from(err: std::io::Error) -> Self {
    ChessYoloError::ModelLoad(err)
  }
}

impl From<ort::Error> for ChessYoloError {
  fn from(err: ort::Error) -> Self {
    ChessYoloError::Ort(err)
  }
}

/// 进程级一次性初始化状态；None 表示尚未初始化
static ORT_INIT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

/// 初始化 ONNX Runtime。幂等，可重复调用；
/// 首次调用的成败会被记住并原样返回给之后的调用者。
pub fn initialize() -> Result<(), ChessYoloError> {
  let mut state = match ORT_INIT.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  };

  if state.is_none() {
    info!("初始化 ONNX Runtime");
    let outcome = ort::init()
      .with_name("guanqi")
      .commit()
      .map(|_| ())
      .map_err(|e| e.to_string());
    if let Err(e) = &outcome {
      debug!("ONNX Runtime 初始化失败: {}", e);
    }
    *state = Some(outcome);
  }

  match state.as_ref() {
    Some(Ok(())) => Ok(()),
    Some(Err(e)) => Err(ChessYoloError::RuntimeInit(e.clone())),
    None => unreachable!(),
  }
}

enum ModelSource {
  Path(String),
  Bytes(Vec<u8>),
}

pub struct ChessYoloBuilder {
  source: ModelSource,
  labels: Vec<String>,
  confidence_threshold: f32,
  iou_threshold: f32,
}

const CHESS_YOLO_SCHEME: &str = "yolo11";

impl FromUrlWithScheme for ChessYoloBuilder {
  const SCHEME: &'static str = CHESS_YOLO_SCHEME;
}

impl FromUrl for ChessYoloBuilder {
  type Error = ChessYoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != CHESS_YOLO_SCHEME {
      return Err(ChessYoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        CHESS_YOLO_SCHEME
      )));
    }

    Ok(ChessYoloBuilder::from_path(url.path()))
  }
}

impl ChessYoloBuilder {
  pub fn from_path(path: &str) -> Self {
    ChessYoloBuilder {
      source: ModelSource::Path(path.to_string()),
      labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
      confidence_threshold: CONFIDENCE_THRESHOLD,
      iou_threshold: IOU_THRESHOLD,
    }
  }

  /// 资产加载器契约：模型权重字节进、标签表进
  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    ChessYoloBuilder {
      source: ModelSource::Bytes(bytes),
      labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
      confidence_threshold: CONFIDENCE_THRESHOLD,
      iou_threshold: IOU_THRESHOLD,
    }
  }

  /// 有序标签表，索引即类别 id
  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn build(self) -> Result<ChessYolo, ChessYoloError> {
    initialize()?;

    if self.labels.len() != CHESS_CLASS_NUM {
      return Err(ChessYoloError::LabelCount {
        expected: CHESS_CLASS_NUM,
        actual: self.labels.len(),
      });
    }

    let mut kinds = Vec::with_capacity(CHESS_CLASS_NUM);
    for label in &self.labels {
      let kind = PieceKind::from_label(label)
        .ok_or_else(|| ChessYoloError::ModelInvalid(format!("无法识别的标签: {}", label)))?;
      kinds.push(kind);
    }

    let model_data = match self.source {
      ModelSource::Bytes(bytes) => bytes,
      ModelSource::Path(path) => {
        info!("加载模型文件: {}", path);
        std::fs::read(&path)?
      }
    };
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 ONNX 推理会话");
    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(2)?
      .commit_from_memory(&model_data)?;
    info!("模型加载完成");

    Ok(ChessYolo {
      session: Mutex::new(session),
      kinds,
      confidence_threshold: self.confidence_threshold,
      iou_threshold: self.iou_threshold,
    })
  }
}

/// 棋子检测模型。
/// 会话不支持并发推理，依赖调度器的单在飞不变式串行化调用；
/// 这里的互斥锁按构造不会发生竞争。
pub struct ChessYolo {
  session: Mutex<Session>,
  /// 类别索引 → 棋子种类
  kinds: Vec<PieceKind>,
  confidence_threshold: f32,
  iou_threshold: f32,
}

impl Model for ChessYolo {
  type Input = Frame;
  type Output = DetectResult;
  type Error = ChessYoloError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("预处理 {}x{} 帧", input.width(), input.height());
    let tensor = preprocess(&input.image);

    let edge = CHESS_INPUT_EDGE as usize;
    let value = Value::from_array(([1usize, RGB_CHANNELS, edge, edge], tensor))?;

    debug!("执行模型推理");
    let mut session = match self.session.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let outputs = session.run(ort::inputs![value])?;

    let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    let candidates = decode_candidates(data, &self.kinds, self.confidence_threshold);
    let items = non_max_suppression(candidates, self.iou_threshold);
    debug!("检测到 {} 个棋子", items.len());

    Ok(DetectResult { items })
  }
}

/// 按行解码候选，过滤低置信度者。
/// 行长固定为 5 + 类别数，结尾不足一行的数据按格式错误跳过。
fn decode_candidates(
  data: &[f32],
  kinds: &[PieceKind],
  confidence_threshold: f32,
) -> Vec<Detection> {
  let mut candidates = Vec::new();

  for row in data.chunks_exact(CANDIDATE_STRIDE) {
    let objectness = row[4];
    if objectness < confidence_threshold {
      continue;
    }

    let mut max_class_score = f32::MIN;
    let mut max_class_id = 0usize;
    for (class_id, &score) in row[5..].iter().enumerate() {
      if score > max_class_score {
        max_class_score = score;
        max_class_id = class_id;
      }
    }

    let score = objectness * max_class_score;
    if score < confidence_threshold {
      continue;
    }

    candidates.push(Detection {
      kind: kinds[max_class_id],
      score,
      bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
      square: None,
    });
  }

  candidates
}

/// 非极大值抑制。
/// 按置信度稳定降序排序后贪心选取，IoU 超过阈值的后续候选被抑制；
/// 输入张量相同则输出必然相同。
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut suppressed = vec![false; candidates.len()];
  let mut selected = Vec::new();

  for i in 0..candidates.len() {
    if suppressed[i] {
      continue;
    }
    for j in (i + 1)..candidates.len() {
      if !suppressed[j] && candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
        suppressed[j] = true;
      }
    }
    selected.push(candidates[i].clone());
  }

  selected
}

/// 缩放到 640×640，各通道归一化到 [0,1]，按 NCHW 排列
fn preprocess(image: &RgbImage) -> Vec<f32> {
  let resized = image::imageops::resize(
    image,
    CHESS_INPUT_EDGE,
    CHESS_INPUT_EDGE,
    image::imageops::FilterType::Triangle,
  );

  let edge = CHESS_INPUT_EDGE as usize;
  let plane = edge * edge;
  let mut data = vec![0f32; RGB_CHANNELS * plane];

  for (x, y, pixel) in resized.enumerate_pixels() {
    let idx = y as usize * edge + x as usize;
    for c in 0..RGB_CHANNELS {
      data[c * plane + idx] = pixel[c] as f32 / 255.0;
    }
  }

  data
}
