// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/model.rs - 解码配置与决策定义
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

use serde::Serialize;
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

mod decoder;
mod label;
mod layout;

pub use self::decoder::Decoder;
pub use self::label::LabelSet;
pub use self::layout::{ValidatedLayout, validate};

/// 框头 `[x, y, w, h]` 之后紧跟 objectness
pub const DEFAULT_OBJECTNESS_OFFSET: usize = 4;
const BOX_FIELDS: usize = 4;
/// 类别数量上限，超出时在加载配置时拒绝
pub const MAX_CLASSES: usize = 4096;

/// 紧凑记录 `objectness_offset + 1 + num_classes` 的宽度，溢出时为 `None`
fn compact_record_width(objectness_offset: usize, num_classes: usize) -> Option<usize> {
  objectness_offset.checked_add(1)?.checked_add(num_classes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderMode {
  /// 只取 objectness 最高的候选框
  SingleBest,
  /// 逐类别统计所有候选框上的最高置信度
  PerClassMaxima,
  /// 整图分类器，输出即 K 维类别分数
  FlatClassifier,
}

impl DecoderMode {
  pub fn is_detector(&self) -> bool {
    !matches!(self, DecoderMode::FlatClassifier)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      DecoderMode::SingleBest => "single-best",
      DecoderMode::PerClassMaxima => "per-class-maxima",
      DecoderMode::FlatClassifier => "flat-classifier",
    }
  }
}

impl std::str::FromStr for DecoderMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "single-best" => Ok(DecoderMode::SingleBest),
      "per-class-maxima" => Ok(DecoderMode::PerClassMaxima),
      "flat-classifier" => Ok(DecoderMode::FlatClassifier),
      other => Err(ConfigError::UnknownMode(other.to_string())),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("未知的解码模式: {0}")]
  UnknownMode(String),
  #[error("未知的标签集: {0}")]
  UnknownLabelSet(String),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("缺少参数: {0}")]
  MissingParameter(&'static str),
  #[error("类别数量不能为 0")]
  NoClasses,
  #[error("类别数量 {num_classes} 超过上限 {max}")]
  TooManyClasses { num_classes: usize, max: usize },
  #[error("objectness 偏移 {objectness_offset} 加类别数 {num_classes} 超出可表示范围")]
  LayoutOverflow {
    objectness_offset: usize,
    num_classes: usize,
  },
  #[error("标签集 {labels} 有 {expected} 个标签，但配置了 {actual} 个类别")]
  LabelCountMismatch {
    labels: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error(
    "记录宽度 {record_width} 不足以容纳 objectness 偏移 {objectness_offset} 之后的 {num_classes} 个类别"
  )]
  RecordTooNarrow {
    record_width: usize,
    objectness_offset: usize,
    num_classes: usize,
  },
}

/// 加载时确定的解码参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
  mode: DecoderMode,
  num_classes: usize,
  record_width: usize,
  objectness_offset: usize,
  labels: LabelSet,
}

impl DecoderConfig {
  pub fn new(mode: DecoderMode, num_classes: usize) -> Self {
    Self {
      mode,
      num_classes,
      record_width: compact_record_width(DEFAULT_OBJECTNESS_OFFSET, num_classes)
        .unwrap_or(usize::MAX),
      objectness_offset: DEFAULT_OBJECTNESS_OFFSET,
      labels: LabelSet::Index,
    }
  }

  pub fn single_best(num_classes: usize) -> Self {
    Self::new(DecoderMode::SingleBest, num_classes)
  }

  pub fn per_class_maxima(num_classes: usize) -> Self {
    Self::new(DecoderMode::PerClassMaxima, num_classes)
  }

  pub fn flat_classifier(num_classes: usize) -> Self {
    Self::new(DecoderMode::FlatClassifier, num_classes)
  }

  pub fn record_width(mut self, record_width: usize) -> Self {
    self.record_width = record_width;
    self
  }

  /// 同时把记录宽度更新为紧凑布局的默认值
  pub fn objectness_offset(mut self, objectness_offset: usize) -> Self {
    self.objectness_offset = objectness_offset;
    self.record_width =
      compact_record_width(objectness_offset, self.num_classes).unwrap_or(usize::MAX);
    self
  }

  pub fn labels(mut self, labels: LabelSet) -> Self {
    self.labels = labels;
    self
  }

  pub fn mode(&self) -> DecoderMode {
    self.mode
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn get_record_width(&self) -> usize {
    self.record_width
  }

  pub fn get_objectness_offset(&self) -> usize {
    self.objectness_offset
  }

  pub fn get_labels(&self) -> LabelSet {
    self.labels
  }

  /// 表示“无有效类别”的越界索引
  pub fn sentinel(&self) -> usize {
    self.num_classes
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.num_classes == 0 {
      return Err(ConfigError::NoClasses);
    }
    if self.num_classes > MAX_CLASSES {
      return Err(ConfigError::TooManyClasses {
        num_classes: self.num_classes,
        max: MAX_CLASSES,
      });
    }
    if let Some(expected) = self.labels.len() {
      if expected != self.num_classes {
        return Err(ConfigError::LabelCountMismatch {
          labels: self.labels.as_str(),
          expected,
          actual: self.num_classes,
        });
      }
    }
    if !self.mode.is_detector() {
      return Ok(());
    }
    let Some(min_width) = compact_record_width(self.objectness_offset, self.num_classes) else {
      return Err(ConfigError::LayoutOverflow {
        objectness_offset: self.objectness_offset,
        num_classes: self.num_classes,
      });
    };
    if self.record_width < min_width {
      return Err(ConfigError::RecordTooNarrow {
        record_width: self.record_width,
        objectness_offset: self.objectness_offset,
        num_classes: self.num_classes,
      });
    }
    Ok(())
  }
}

impl FromUrlWithScheme for DecoderConfig {
  const SCHEME: &'static str = "decoder";
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
  value.parse().map_err(|_| ConfigError::InvalidParameter {
    key: key.to_string(),
    value: value.to_string(),
  })
}

impl FromUrl for DecoderConfig {
  type Error = ConfigError;

  /// `decoder:single-best?classes=5&record_width=10&objectness_offset=4&labels=traffic-sign`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let mode: DecoderMode = url.path().trim_matches('/').parse()?;

    let mut num_classes = None;
    let mut record_width = None;
    let mut objectness_offset = None;
    let mut labels = None;
    for (k, v) in url.query_pairs() {
      match &*k {
        "classes" => num_classes = Some(parse_usize(&k, &v)?),
        "record_width" => record_width = Some(parse_usize(&k, &v)?),
        "objectness_offset" => objectness_offset = Some(parse_usize(&k, &v)?),
        "labels" => labels = Some(v.parse::<LabelSet>()?),
        _ => {}
      }
    }

    let num_classes = num_classes.ok_or(ConfigError::MissingParameter("classes"))?;
    let mut config = DecoderConfig::new(mode, num_classes);
    if let Some(offset) = objectness_offset {
      config = config.objectness_offset(offset);
    }
    if let Some(width) = record_width {
      config = config.record_width(width);
    }
    if let Some(labels) = labels {
      config = config.labels(labels);
    }
    config.validate()?;
    Ok(config)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeMismatch {
  #[error("元素数量 {element_count} 不能被记录宽度 {record_width} 整除")]
  NotDivisible {
    element_count: usize,
    record_width: usize,
  },
  #[error("张量末维 {actual} 与记录宽度 {expected} 不符")]
  RecordAxis { expected: usize, actual: usize },
  #[error("类别数量不符: 期望 {expected}, 实际 {actual}")]
  ClassCount { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("张量形状不匹配: {0}")]
  ShapeMismatch(#[from] ShapeMismatch),
}

/// 可在本地恢复的退化情况，决策退回哨兵值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
  EmptyCandidateSet,
  DegenerateScores,
}

impl std::fmt::Display for Fallback {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Fallback::EmptyCandidateSet => write!(f, "没有候选框"),
      Fallback::DegenerateScores => write!(f, "分数全部相等"),
    }
  }
}

/// 单一最佳候选框的解码结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub class_index: usize,
  pub confidence: f32,
  pub objectness: f32,
  /// 胜出候选框的序号
  pub candidate: Option<usize>,
  /// 胜出候选框的原始 `[x, y, w, h]`
  pub bbox: [f32; 4],
  pub fallback: Option<Fallback>,
}

/// 整图分类（或逐类别最大值的 argmax）结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
  pub class_index: usize,
  pub score: f32,
  pub fallback: Option<Fallback>,
}

/// 每个类别在全部候选框上见到的最高置信度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMaxima {
  pub maxima: Box<[f32]>,
  pub fallback: Option<Fallback>,
}

impl ClassMaxima {
  pub fn get(&self, class_index: usize) -> Option<f32> {
    self.maxima.get(class_index).copied()
  }

  pub fn num_classes(&self) -> usize {
    self.maxima.len()
  }

  /// 对各类别最大值再取 argmax
  pub fn best(&self) -> Classification {
    if self.fallback == Some(Fallback::EmptyCandidateSet) {
      return Classification {
        class_index: self.maxima.len(),
        score: 0.0,
        fallback: self.fallback,
      };
    }
    decoder::argmax(self.maxima.iter().copied(), self.maxima.len())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
  Detection(Detection),
  ClassMaxima(ClassMaxima),
  Classification(Classification),
}

impl Decision {
  pub fn fallback(&self) -> Option<Fallback> {
    match self {
      Decision::Detection(d) => d.fallback,
      Decision::ClassMaxima(m) => m.fallback,
      Decision::Classification(c) => c.fallback,
    }
  }

  /// 最终类别及其分数，逐类别模式下取各类别最大值的 argmax
  pub fn class_and_score(&self) -> (usize, f32) {
    match self {
      Decision::Detection(d) => (d.class_index, d.confidence),
      Decision::ClassMaxima(m) => {
        let best = m.best();
        (best.class_index, best.score)
      }
      Decision::Classification(c) => (c.class_index, c.score),
    }
  }
}
