// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/model/label.rs - 类别标签
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

use super::ConfigError;

/// 交通标志检测模型的 5 个类别
pub const TRAFFIC_SIGN_LABELS: [&str; 5] = ["straight", "roundabout", "left", "right", "stop"];

/// 交通标志分类模型的 6 个类别，含“无标志”
pub const TRAFFIC_SIGN_NEGATIVE_LABELS: [&str; 6] = [
  "straight",
  "roundabout",
  "left",
  "negative",
  "right",
  "stop",
];

pub const PERSON_LABELS: [&str; 2] = ["no-person", "person"];

const SENTINEL_LABEL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelSet {
  /// 直接显示类别索引
  #[default]
  Index,
  TrafficSign,
  TrafficSignNegative,
  Person,
}

impl LabelSet {
  fn names(&self) -> &'static [&'static str] {
    match self {
      LabelSet::Index => &[],
      LabelSet::TrafficSign => &TRAFFIC_SIGN_LABELS,
      LabelSet::TrafficSignNegative => &TRAFFIC_SIGN_NEGATIVE_LABELS,
      LabelSet::Person => &PERSON_LABELS,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      LabelSet::Index => "index",
      LabelSet::TrafficSign => "traffic-sign",
      LabelSet::TrafficSignNegative => "traffic-sign-negative",
      LabelSet::Person => "person",
    }
  }

  /// 类别数量，`Index` 不限定
  pub fn len(&self) -> Option<usize> {
    match self {
      LabelSet::Index => None,
      _ => Some(self.names().len()),
    }
  }

  pub fn name(&self, class_index: usize) -> Option<&'static str> {
    self.names().get(class_index).copied()
  }

  /// 哨兵索引显示为 `none`
  pub fn to_label_str(&self, class_index: usize, num_classes: usize) -> String {
    if class_index >= num_classes {
      return SENTINEL_LABEL.to_string();
    }
    match self.name(class_index) {
      Some(name) => name.to_string(),
      None => class_index.to_string(),
    }
  }
}

impl std::str::FromStr for LabelSet {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "index" => Ok(LabelSet::Index),
      "traffic-sign" => Ok(LabelSet::TrafficSign),
      "traffic-sign-negative" => Ok(LabelSet::TrafficSignNegative),
      "person" => Ok(LabelSet::Person),
      other => Err(ConfigError::UnknownLabelSet(other.to_string())),
    }
  }
}
