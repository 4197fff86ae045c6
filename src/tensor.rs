// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/tensor.rs - 推理输出张量视图
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
  Int8,
  #[serde(rename = "uint8")]
  UInt8,
  Float32,
}

impl std::fmt::Display for ElementType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ElementType::Int8 => write!(f, "int8"),
      ElementType::UInt8 => write!(f, "uint8"),
      ElementType::Float32 => write!(f, "float32"),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
  #[error("张量形状为空")]
  EmptyShape,
  #[error("元素数量与形状不符: 形状 {shape:?} 需要 {expected} 个元素, 实际 {actual} 个")]
  ElementCountMismatch {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
  },
  #[error("记录数据类型 {declared} 与数据内容不符")]
  ElementTypeMismatch { declared: ElementType },
}

/// 量化参数，`real = (raw - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
  pub scale: f32,
  pub zero_point: i32,
}

impl Quantization {
  pub fn new(scale: f32, zero_point: i32) -> Self {
    Self { scale, zero_point }
  }

  pub fn dequantize(&self, raw: f32) -> f32 {
    (raw - self.zero_point as f32) * self.scale
  }
}

/// 推理运行时发布的只读数据
#[derive(Debug, Clone, Copy)]
pub enum TensorSlice<'a> {
  Int8(&'a [i8]),
  UInt8(&'a [u8]),
  Float32(&'a [f32]),
}

impl TensorSlice<'_> {
  pub fn len(&self) -> usize {
    match self {
      TensorSlice::Int8(data) => data.len(),
      TensorSlice::UInt8(data) => data.len(),
      TensorSlice::Float32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn element_type(&self) -> ElementType {
    match self {
      TensorSlice::Int8(_) => ElementType::Int8,
      TensorSlice::UInt8(_) => ElementType::UInt8,
      TensorSlice::Float32(_) => ElementType::Float32,
    }
  }
}

/// 单次推理的输出张量视图。
///
/// 数据归推理运行时所有，视图只在本帧内有效，解码器只读不写。
/// 构造时保证 `element_count == product(shape)`。
#[derive(Debug, Clone)]
pub struct OutputTensor<'a> {
  data: TensorSlice<'a>,
  shape: Box<[usize]>,
  quantization: Option<Quantization>,
}

impl<'a> OutputTensor<'a> {
  pub fn new(data: TensorSlice<'a>, shape: &[usize]) -> Result<Self, TensorError> {
    if shape.is_empty() {
      return Err(TensorError::EmptyShape);
    }
    // 饱和乘法: 溢出时为 usize::MAX，任何切片都不可能有这么多元素
    let expected = shape.iter().copied().fold(1, usize::saturating_mul);
    if expected != data.len() {
      return Err(TensorError::ElementCountMismatch {
        shape: shape.to_vec(),
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      data,
      shape: shape.into(),
      quantization: None,
    })
  }

  /// 形状为一维 `[len]` 的视图
  pub fn flat(data: TensorSlice<'a>) -> Self {
    let len = data.len();
    Self {
      data,
      shape: Box::new([len]),
      quantization: None,
    }
  }

  pub fn with_quantization(mut self, quantization: Option<Quantization>) -> Self {
    self.quantization = quantization;
    self
  }

  pub fn element_count(&self) -> usize {
    self.data.len()
  }

  pub fn element_type(&self) -> ElementType {
    self.data.element_type()
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn quantization(&self) -> Option<Quantization> {
    self.quantization
  }

  /// 读取原始数值。越界读取属于编程错误，直接 panic。
  pub fn read(&self, offset: usize) -> f32 {
    match self.data {
      TensorSlice::Int8(data) => data[offset] as f32,
      TensorSlice::UInt8(data) => data[offset] as f32,
      TensorSlice::Float32(data) => data[offset],
    }
  }

  /// 读取数值，带量化参数时先反量化
  pub fn value(&self, offset: usize) -> f32 {
    let raw = self.read(offset);
    match self.quantization {
      Some(q) => q.dequantize(raw),
      None => raw,
    }
  }
}

/// 张量的自有副本，用于回放录制的推理输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTensor {
  pub element_type: ElementType,
  pub shape: Vec<usize>,
  pub data: Vec<f64>,
  #[serde(default)]
  pub quantization: Option<Quantization>,
  #[serde(skip)]
  storage: Option<RecordedStorage>,
}

#[derive(Debug, Clone)]
enum RecordedStorage {
  Int8(Box<[i8]>),
  UInt8(Box<[u8]>),
  Float32(Box<[f32]>),
}

impl RecordedTensor {
  pub fn new(element_type: ElementType, shape: Vec<usize>, data: Vec<f64>) -> Self {
    Self {
      element_type,
      shape,
      data,
      quantization: None,
      storage: None,
    }
  }

  pub fn with_quantization(mut self, quantization: Quantization) -> Self {
    self.quantization = Some(quantization);
    self
  }

  /// 按声明类型转换数据，量化类型的值必须是落在类型范围内的整数
  pub fn prepare(&mut self) -> Result<(), TensorError> {
    let declared = self.element_type;
    let mismatch = || TensorError::ElementTypeMismatch { declared };
    let storage = match declared {
      ElementType::Int8 => RecordedStorage::Int8(
        self
          .data
          .iter()
          .map(|&v| integral_in(v, i8::MIN as f64, i8::MAX as f64).map(|v| v as i8))
          .collect::<Option<_>>()
          .ok_or_else(mismatch)?,
      ),
      ElementType::UInt8 => RecordedStorage::UInt8(
        self
          .data
          .iter()
          .map(|&v| integral_in(v, u8::MIN as f64, u8::MAX as f64).map(|v| v as u8))
          .collect::<Option<_>>()
          .ok_or_else(mismatch)?,
      ),
      ElementType::Float32 => {
        RecordedStorage::Float32(self.data.iter().map(|&v| v as f32).collect())
      }
    };
    self.storage = Some(storage);
    Ok(())
  }

  pub fn view(&mut self) -> Result<OutputTensor<'_>, TensorError> {
    if self.storage.is_none() {
      self.prepare()?;
    }
    let data = match self.storage.as_ref() {
      Some(RecordedStorage::Int8(data)) => TensorSlice::Int8(data),
      Some(RecordedStorage::UInt8(data)) => TensorSlice::UInt8(data),
      Some(RecordedStorage::Float32(data)) => TensorSlice::Float32(data),
      None => return Err(TensorError::ElementTypeMismatch {
        declared: self.element_type,
      }),
    };
    Ok(OutputTensor::new(data, &self.shape)?.with_quantization(self.quantization))
  }
}

fn integral_in(value: f64, min: f64, max: f64) -> Option<f64> {
  (value.fract() == 0.0 && value >= min && value <= max).then_some(value)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shape_must_cover_every_element() {
    let data = [0.0f32; 10];
    let err = OutputTensor::new(TensorSlice::Float32(&data), &[1, 3, 3]).unwrap_err();
    assert_eq!(
      err,
      TensorError::ElementCountMismatch {
        shape: vec![1, 3, 3],
        expected: 9,
        actual: 10
      }
    );
    assert_eq!(
      OutputTensor::new(TensorSlice::Float32(&data), &[]).unwrap_err(),
      TensorError::EmptyShape
    );
  }

  #[test]
  fn oversized_shape_is_a_mismatch() {
    let data: [f32; 0] = [];
    let err = OutputTensor::new(TensorSlice::Float32(&data), &[usize::MAX, 2, 1]).unwrap_err();
    assert_eq!(
      err,
      TensorError::ElementCountMismatch {
        shape: vec![usize::MAX, 2, 1],
        expected: usize::MAX,
        actual: 0
      }
    );
    // 任一维为 0 时元素数量就是 0
    let tensor = OutputTensor::new(TensorSlice::Float32(&data), &[usize::MAX, 2, 0]).unwrap();
    assert_eq!(tensor.element_count(), 0);
  }

  #[test]
  fn quantized_values_pass_through_without_parameters() {
    let data = [-128i8, 0, 127];
    let tensor = OutputTensor::new(TensorSlice::Int8(&data), &[3]).unwrap();
    assert_eq!(tensor.element_type(), ElementType::Int8);
    assert_eq!(tensor.value(0), -128.0);
    assert_eq!(tensor.value(2), 127.0);

    let tensor = tensor.with_quantization(Some(Quantization::new(1.0 / 256.0, -128)));
    assert_eq!(tensor.value(0), 0.0);
    assert_eq!(tensor.value(1), 0.5);
    assert_eq!(tensor.read(1), 0.0);
  }

  #[test]
  fn recorded_tensor_rejects_out_of_range_quantized_values() {
    let mut recorded = RecordedTensor::new(ElementType::UInt8, vec![2], vec![12.0, 300.0]);
    assert_eq!(
      recorded.view().unwrap_err(),
      TensorError::ElementTypeMismatch {
        declared: ElementType::UInt8
      }
    );

    let mut recorded = RecordedTensor::new(ElementType::Int8, vec![2], vec![-3.0, 0.5]);
    assert!(recorded.view().is_err());
  }

  #[test]
  fn recorded_tensor_deserializes_from_json() {
    let mut recorded: RecordedTensor = serde_json::from_str(
      r#"{"element_type":"uint8","shape":[1,6],"data":[10,200,50,0,0,5]}"#,
    )
    .unwrap();
    let view = recorded.view().unwrap();
    assert_eq!(view.element_type(), ElementType::UInt8);
    assert_eq!(view.shape(), &[1, 6]);
    assert_eq!(view.read(1), 200.0);
  }
}
