// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/model/layout.rs - 输出张量形状校验
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

use tracing::debug;

use super::{DecoderConfig, ShapeMismatch};
use crate::tensor::OutputTensor;

/// 校验通过后的布局，之后的所有读取都以它为界
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatedLayout {
  Detector {
    num_candidates: usize,
    record_width: usize,
  },
  Classifier {
    num_classes: usize,
  },
}

/// 检查张量的元素数量与形状是否符合配置的模型布局。
///
/// 检测模型要求元素数量是记录宽度的整数倍；二维及以上的形状还要求末维就是记录宽度，
/// 这样模型类别数变化导致的记录宽度变化会在这里被拦下，而不是被错位读取。
/// 分类模型要求元素数量正好等于类别数。
pub fn validate(
  config: &DecoderConfig,
  tensor: &OutputTensor<'_>,
) -> Result<ValidatedLayout, ShapeMismatch> {
  let element_count = tensor.element_count();
  let shape = tensor.shape();

  if !config.mode().is_detector() {
    if element_count != config.num_classes() {
      return Err(ShapeMismatch::ClassCount {
        expected: config.num_classes(),
        actual: element_count,
      });
    }
    return Ok(ValidatedLayout::Classifier {
      num_classes: element_count,
    });
  }

  let record_width = config.get_record_width();
  if shape.len() >= 2 {
    let last = shape[shape.len() - 1];
    if last != record_width {
      return Err(ShapeMismatch::RecordAxis {
        expected: record_width,
        actual: last,
      });
    }
  }
  if element_count % record_width != 0 {
    return Err(ShapeMismatch::NotDivisible {
      element_count,
      record_width,
    });
  }

  let num_candidates = element_count / record_width;
  debug!(
    "输出张量 {:?} ({}), 候选框 {} 个, 记录宽度 {}",
    shape,
    tensor.element_type(),
    num_candidates,
    record_width
  );
  Ok(ValidatedLayout::Detector {
    num_candidates,
    record_width,
  })
}
