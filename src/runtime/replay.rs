// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/runtime/replay.rs - 录制输出张量回放
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

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::Inference;
use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  tensor::{OutputTensor, RecordedTensor, TensorError},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("张量错误: {0}")]
  TensorError(#[from] TensorError),
  #[error("回放文件中没有张量")]
  Empty,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayFile {
  Many(Vec<RecordedTensor>),
  One(RecordedTensor),
}

/// 不接触硬件的推理运行时: 按顺序循环发布录制好的输出张量，忽略输入帧内容。
///
/// 文件内容是单个张量或张量数组:
/// `{"element_type": "float32", "shape": [1, 2, 10], "data": [...]}`
pub struct ReplayRuntime<Frame> {
  tensors: Vec<RecordedTensor>,
  cursor: usize,
  _phantom: std::marker::PhantomData<Frame>,
}

impl<Frame> ReplayRuntime<Frame> {
  pub fn new(mut tensors: Vec<RecordedTensor>) -> Result<Self, ReplayError> {
    if tensors.is_empty() {
      return Err(ReplayError::Empty);
    }
    for tensor in tensors.iter_mut() {
      tensor.prepare()?;
      // 提前检查形状，避免运行中途才失败
      tensor.view()?;
    }
    Ok(Self {
      tensors,
      cursor: 0,
      _phantom: std::marker::PhantomData,
    })
  }

  pub fn from_json(json: &str) -> Result<Self, ReplayError> {
    let tensors = match serde_json::from_str(json)? {
      ReplayFile::Many(tensors) => tensors,
      ReplayFile::One(tensor) => vec![tensor],
    };
    Self::new(tensors)
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }
}

impl<Frame> FromUrlWithScheme for ReplayRuntime<Frame> {
  const SCHEME: &'static str = "replay";
}

impl<Frame> FromUrl for ReplayRuntime<Frame> {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch);
    }

    let path = decoded_path(url);
    info!("加载回放文件: {}", path);
    let json = std::fs::read_to_string(&path)?;
    let runtime = Self::from_json(&json)?;
    info!("回放张量数量: {}", runtime.len());
    Ok(runtime)
  }
}

impl<Frame> Inference for ReplayRuntime<Frame> {
  type Input = Frame;
  type Error = ReplayError;

  fn infer(&mut self, _input: &Self::Input) -> Result<OutputTensor<'_>, Self::Error> {
    let index = self.cursor % self.tensors.len();
    self.cursor = self.cursor.wrapping_add(1);
    debug!("回放第 {} 个张量", index);
    Ok(self.tensors[index].view()?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn replays_tensors_in_a_cycle() {
    let json = r#"[
      {"element_type": "uint8", "shape": [3], "data": [1, 2, 3]},
      {"element_type": "float32", "shape": [1, 2], "data": [0.5, 0.25]}
    ]"#;
    let mut runtime = ReplayRuntime::<()>::from_json(json).unwrap();
    assert_eq!(runtime.len(), 2);
    assert_eq!(runtime.infer(&()).unwrap().element_count(), 3);
    assert_eq!(runtime.infer(&()).unwrap().shape(), &[1, 2]);
    assert_eq!(runtime.infer(&()).unwrap().read(2), 3.0);
  }

  #[test]
  fn single_tensor_file_is_accepted() {
    let json = r#"{"element_type": "int8", "shape": [2], "data": [-1, 1],
                   "quantization": {"scale": 0.5, "zero_point": 1}}"#;
    let mut runtime = ReplayRuntime::<()>::from_json(json).unwrap();
    let tensor = runtime.infer(&()).unwrap();
    assert_eq!(tensor.value(0), -1.0);
    assert_eq!(tensor.value(1), 0.0);
  }

  #[test]
  fn malformed_recordings_fail_at_load() {
    assert!(matches!(
      ReplayRuntime::<()>::from_json("[]"),
      Err(ReplayError::Empty)
    ));
    assert!(matches!(
      ReplayRuntime::<()>::from_json(r#"{"element_type": "float32", "shape": [4], "data": [1.0]}"#),
      Err(ReplayError::TensorError(TensorError::ElementCountMismatch { .. }))
    ));
  }

  #[test]
  fn huge_recorded_shapes_do_not_overflow() {
    let json = r#"{"element_type": "float32", "shape": [4294967296, 4294967296, 1], "data": []}"#;
    assert!(matches!(
      ReplayRuntime::<()>::from_json(json),
      Err(ReplayError::TensorError(TensorError::ElementCountMismatch { .. }))
    ));

    let json = r#"{"element_type": "float32", "shape": [4294967296, 4294967296, 0], "data": []}"#;
    let mut runtime = ReplayRuntime::<()>::from_json(json).unwrap();
    assert_eq!(runtime.infer(&()).unwrap().element_count(), 0);
  }
}
