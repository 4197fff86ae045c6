// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/model/decoder.rs - 输出张量解码与置信度归约
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

use tracing::{debug, info, warn};

use super::{
  BOX_FIELDS, ClassMaxima, Classification, ConfigError, DecodeError, Decision, DecoderConfig,
  DecoderMode, Detection, Fallback, ValidatedLayout, validate,
};
use crate::tensor::OutputTensor;

/// 按加载时配置解码每一帧的输出张量。
///
/// 解码器不保存任何跨帧状态，同一张量解码两次得到相同结果。
#[derive(Debug, Clone)]
pub struct Decoder {
  config: DecoderConfig,
}

impl Decoder {
  pub fn new(config: DecoderConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    info!(
      "解码器配置: 模式 {}, 类别 {}, 记录宽度 {}, objectness 偏移 {}",
      config.mode().as_str(),
      config.num_classes(),
      config.get_record_width(),
      config.get_objectness_offset()
    );
    Ok(Self { config })
  }

  pub fn config(&self) -> &DecoderConfig {
    &self.config
  }

  pub fn decode(&self, tensor: &OutputTensor<'_>) -> Result<Decision, DecodeError> {
    let layout = match validate(&self.config, tensor) {
      Ok(layout) => layout,
      Err(e) => {
        warn!("丢弃该帧: {}", e);
        return Err(e.into());
      }
    };

    let decision = match layout {
      ValidatedLayout::Detector {
        num_candidates,
        record_width,
      } => {
        let records = Records {
          tensor,
          num_candidates,
          record_width,
          objectness_offset: self.config.get_objectness_offset(),
          num_classes: self.config.num_classes(),
        };
        match self.config.mode() {
          DecoderMode::SingleBest => Decision::Detection(single_best(&records)),
          _ => Decision::ClassMaxima(per_class_maxima(&records)),
        }
      }
      ValidatedLayout::Classifier { num_classes } => Decision::Classification(argmax(
        (0..num_classes).map(|i| tensor.value(i)),
        num_classes,
      )),
    };

    if let Some(fallback) = decision.fallback() {
      warn!("解码退回哨兵值: {}", fallback);
    }
    debug!("解码结果: {:?}", decision);
    Ok(decision)
  }
}

/// 已校验的候选框记录，所有偏移都落在 `num_candidates * record_width` 之内
struct Records<'t, 'a> {
  tensor: &'t OutputTensor<'a>,
  num_candidates: usize,
  record_width: usize,
  objectness_offset: usize,
  num_classes: usize,
}

impl Records<'_, '_> {
  fn objectness(&self, candidate: usize) -> f32 {
    self
      .tensor
      .value(candidate * self.record_width + self.objectness_offset)
  }

  fn class_prob(&self, candidate: usize, class_index: usize) -> f32 {
    self
      .tensor
      .value(candidate * self.record_width + self.objectness_offset + 1 + class_index)
  }

  fn bbox(&self, candidate: usize) -> [f32; 4] {
    if self.objectness_offset < BOX_FIELDS {
      return [0.0; 4];
    }
    let base = candidate * self.record_width + self.objectness_offset - BOX_FIELDS;
    [
      self.tensor.value(base),
      self.tensor.value(base + 1),
      self.tensor.value(base + 2),
      self.tensor.value(base + 3),
    ]
  }
}

fn no_detection(num_classes: usize, fallback: Fallback) -> Detection {
  Detection {
    class_index: num_classes,
    confidence: 0.0,
    objectness: 0.0,
    candidate: None,
    bbox: [0.0; 4],
    fallback: Some(fallback),
  }
}

/// objectness 最高的候选框胜出（相等时先出现者保留），
/// 再在它的类别置信度 `objectness * class_i` 上取 argmax。
/// 非有限的 objectness 不参与比较。
fn single_best(records: &Records<'_, '_>) -> Detection {
  if records.num_candidates == 0 {
    return no_detection(records.num_classes, Fallback::EmptyCandidateSet);
  }

  let mut winner: Option<(usize, f32)> = None;
  for candidate in 0..records.num_candidates {
    let objectness = records.objectness(candidate);
    if !objectness.is_finite() {
      continue;
    }
    if winner.is_none_or(|(_, best)| objectness > best) {
      winner = Some((candidate, objectness));
    }
  }

  let Some((candidate, objectness)) = winner else {
    return no_detection(records.num_classes, Fallback::DegenerateScores);
  };

  let class = argmax(
    (0..records.num_classes).map(|c| objectness * records.class_prob(candidate, c)),
    records.num_classes,
  );

  Detection {
    class_index: class.class_index,
    confidence: class.score,
    objectness,
    candidate: Some(candidate),
    bbox: records.bbox(candidate),
    fallback: class.fallback,
  }
}

/// 每个类别在所有候选框上的最高置信度，不做 NMS，也不记录来源候选框
fn per_class_maxima(records: &Records<'_, '_>) -> ClassMaxima {
  if records.num_candidates == 0 {
    return ClassMaxima {
      maxima: vec![0.0; records.num_classes].into_boxed_slice(),
      fallback: Some(Fallback::EmptyCandidateSet),
    };
  }

  let mut maxima = vec![f32::NEG_INFINITY; records.num_classes];
  for candidate in 0..records.num_candidates {
    let objectness = records.objectness(candidate);
    for (c, max) in maxima.iter_mut().enumerate() {
      let confidence = objectness * records.class_prob(candidate, c);
      if confidence.is_finite() && confidence > *max {
        *max = confidence;
      }
    }
  }
  // 没有任何有效置信度的类别按 0 报告
  for max in maxima.iter_mut().filter(|max| **max == f32::NEG_INFINITY) {
    *max = 0.0;
  }

  let fallback = argmax(maxima.iter().copied(), maxima.len()).fallback;
  ClassMaxima {
    maxima: maxima.into_boxed_slice(),
    fallback,
  }
}

/// 严格大于的线性 argmax，相等时先出现者保留。
///
/// 非有限的分数（NaN、无穷）被跳过。所有有效分数相等或没有有效分数时返回哨兵索引
/// `num_classes`；只有一个类别时，仅全零视为退化。
pub(super) fn argmax(scores: impl IntoIterator<Item = f32>, num_classes: usize) -> Classification {
  let mut best: Option<(usize, f32)> = None;
  let mut lowest = f32::INFINITY;
  for (index, score) in scores.into_iter().enumerate() {
    if !score.is_finite() {
      continue;
    }
    lowest = lowest.min(score);
    if best.is_none_or(|(_, max)| score > max) {
      best = Some((index, score));
    }
  }

  let sentinel = Classification {
    class_index: num_classes,
    score: 0.0,
    fallback: Some(Fallback::DegenerateScores),
  };
  let Some((class_index, score)) = best else {
    return sentinel;
  };
  if score == lowest && (num_classes > 1 || score == 0.0) {
    return sentinel;
  }

  Classification {
    class_index,
    score,
    fallback: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ShapeMismatch;
  use crate::tensor::{Quantization, TensorSlice};

  const EPS: f32 = 1e-6;

  fn detector_tensor(data: &[f32], record_width: usize) -> OutputTensor<'_> {
    OutputTensor::new(
      TensorSlice::Float32(data),
      &[1, data.len() / record_width, record_width],
    )
    .unwrap()
  }

  fn record(bbox: [f32; 4], objectness: f32, classes: &[f32]) -> Vec<f32> {
    let mut r = bbox.to_vec();
    r.push(objectness);
    r.extend_from_slice(classes);
    r
  }

  #[test]
  fn single_candidate_picks_highest_class_confidence() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let data = record([0.5, 0.5, 0.2, 0.2], 0.9, &[0.1, 0.8, 0.05, 0.05, 0.0]);
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 10)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.class_index, 1);
    assert!((d.confidence - 0.72).abs() < EPS);
    assert!((d.objectness - 0.9).abs() < EPS);
    assert_eq!(d.candidate, Some(0));
    assert_eq!(d.bbox, [0.5, 0.5, 0.2, 0.2]);
    assert_eq!(d.fallback, None);
  }

  #[test]
  fn first_candidate_wins_objectness_tie() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let mut data = record([0.0; 4], 0.5, &[0.9, 0.1, 0.0, 0.0, 0.0]);
    data.extend(record([1.0; 4], 0.5, &[0.0, 0.0, 0.0, 0.1, 0.9]));
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 10)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.candidate, Some(0));
    assert_eq!(d.class_index, 0);
    assert!((d.confidence - 0.45).abs() < EPS);
  }

  #[test]
  fn later_higher_objectness_replaces_incumbent() {
    let decoder = Decoder::new(DecoderConfig::single_best(3)).unwrap();
    let mut data = record([0.0; 4], 0.4, &[1.0, 0.0, 0.0]);
    data.extend(record([0.0; 4], 0.7, &[0.0, 0.0, 1.0]));
    data.extend(record([0.0; 4], 0.6, &[0.0, 1.0, 0.0]));
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 8)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.candidate, Some(1));
    assert_eq!(d.class_index, 2);
  }

  #[test]
  fn zero_candidates_yield_no_detection_sentinel() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let data: [f32; 0] = [];
    let decision = decoder.decode(&detector_tensor(&data, 10)).unwrap();
    assert_eq!(decision.fallback(), Some(Fallback::EmptyCandidateSet));
    assert_eq!(decision.class_and_score(), (5, 0.0));

    let decoder = Decoder::new(DecoderConfig::per_class_maxima(5)).unwrap();
    let Decision::ClassMaxima(m) = decoder.decode(&detector_tensor(&data, 10)).unwrap() else {
      panic!("expected class maxima");
    };
    assert_eq!(&*m.maxima, &[0.0; 5]);
    assert_eq!(m.best().class_index, 5);
  }

  #[test]
  fn zero_objectness_is_degenerate() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let data = record([0.0; 4], 0.0, &[0.1, 0.8, 0.05, 0.05, 0.0]);
    let decision = decoder.decode(&detector_tensor(&data, 10)).unwrap();
    assert_eq!(decision.fallback(), Some(Fallback::DegenerateScores));
    assert_eq!(decision.class_and_score().0, 5);
  }

  #[test]
  fn nan_objectness_cannot_hide_a_real_candidate() {
    let decoder = Decoder::new(DecoderConfig::single_best(3)).unwrap();
    let mut data = record([0.0; 4], f32::NAN, &[1.0, 0.0, 0.0]);
    data.extend(record([1.0; 4], 0.95, &[0.0, 0.0, 1.0]));
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 8)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.candidate, Some(1));
    assert_eq!(d.class_index, 2);
    assert!((d.confidence - 0.95).abs() < EPS);
    assert_eq!(d.fallback, None);

    let data = record([0.0; 4], f32::NAN, &[1.0, 0.0, 0.0]);
    let decision = decoder.decode(&detector_tensor(&data, 8)).unwrap();
    assert_eq!(decision.class_and_score(), (3, 0.0));
    assert_eq!(decision.fallback(), Some(Fallback::DegenerateScores));
  }

  #[test]
  fn nan_scores_are_skipped_by_every_mode() {
    let decoder = Decoder::new(DecoderConfig::flat_classifier(3)).unwrap();
    let data = [f32::NAN, 0.2, 0.9];
    let decision = decoder.decode(&OutputTensor::flat(TensorSlice::Float32(&data))).unwrap();
    assert_eq!(decision.class_and_score(), (2, 0.9));
    assert_eq!(decision.fallback(), None);

    let data = [f32::NAN, 0.4, 0.4];
    let decision = decoder.decode(&OutputTensor::flat(TensorSlice::Float32(&data))).unwrap();
    assert_eq!(decision.fallback(), Some(Fallback::DegenerateScores));

    let data = [f32::NAN; 3];
    let decision = decoder.decode(&OutputTensor::flat(TensorSlice::Float32(&data))).unwrap();
    assert_eq!(decision.class_and_score(), (3, 0.0));

    let decoder = Decoder::new(DecoderConfig::per_class_maxima(3)).unwrap();
    let mut data = record([0.0; 4], 0.5, &[f32::NAN, 0.2, 0.0]);
    data.extend(record([0.0; 4], f32::NAN, &[1.0, 1.0, 1.0]));
    let Decision::ClassMaxima(m) = decoder.decode(&detector_tensor(&data, 8)).unwrap() else {
      panic!("expected class maxima");
    };
    assert_eq!(&*m.maxima, &[0.0, 0.1, 0.0]);
    assert_eq!(m.best().class_index, 1);
  }

  #[test]
  fn per_class_maxima_matches_brute_force_in_any_order() {
    let candidates = [
      (0.9f32, [0.1f32, 0.8, 0.05, 0.05, 0.0]),
      (0.3, [0.9, 0.05, 0.05, 0.0, 0.0]),
      (0.6, [0.0, 0.1, 0.1, 0.7, 0.1]),
      (0.8, [0.2, 0.2, 0.2, 0.2, 0.2]),
    ];
    let build = |order: &mut dyn Iterator<Item = &(f32, [f32; 5])>| -> Vec<f32> {
      order
        .flat_map(|(o, classes)| record([0.0; 4], *o, classes))
        .collect()
    };
    let forward = build(&mut candidates.iter());
    let reversed = build(&mut candidates.iter().rev());

    let decoder = Decoder::new(DecoderConfig::per_class_maxima(5)).unwrap();
    let Decision::ClassMaxima(a) = decoder.decode(&detector_tensor(&forward, 10)).unwrap() else {
      panic!("expected class maxima");
    };
    let Decision::ClassMaxima(b) = decoder.decode(&detector_tensor(&reversed, 10)).unwrap() else {
      panic!("expected class maxima");
    };
    assert_eq!(a, b);

    for c in 0..5 {
      let expected = candidates
        .iter()
        .map(|(o, classes)| o * classes[c])
        .fold(f32::NEG_INFINITY, f32::max);
      assert!((a.maxima[c] - expected).abs() < EPS, "class {}", c);
    }
    let best = a.best();
    assert_eq!(best.class_index, 1);
    assert!((best.score - 0.72).abs() < EPS);
  }

  #[test]
  fn flat_classifier_picks_largest_uint8_score() {
    let decoder = Decoder::new(DecoderConfig::flat_classifier(6)).unwrap();
    let data = [10u8, 200, 50, 0, 0, 5];
    let tensor = OutputTensor::new(TensorSlice::UInt8(&data), &[1, 6]).unwrap();
    let Decision::Classification(c) = decoder.decode(&tensor).unwrap() else {
      panic!("expected a classification");
    };
    assert_eq!(c.class_index, 1);
    assert_eq!(c.score, 200.0);
    assert_eq!(c.fallback, None);
  }

  #[test]
  fn flat_classifier_handles_signed_and_quantized_scores() {
    let decoder = Decoder::new(DecoderConfig::flat_classifier(4)).unwrap();
    let data = [-100i8, -20, -20, -128];
    let tensor = OutputTensor::flat(TensorSlice::Int8(&data));
    assert_eq!(decoder.decode(&tensor).unwrap().class_and_score(), (1, -20.0));

    let tensor = tensor.with_quantization(Some(Quantization::new(1.0 / 256.0, -128)));
    let (index, score) = decoder.decode(&tensor).unwrap().class_and_score();
    assert_eq!(index, 1);
    assert!((score - 0.421875).abs() < EPS);
  }

  #[test]
  fn equal_scores_report_sentinel() {
    let decoder = Decoder::new(DecoderConfig::flat_classifier(6)).unwrap();
    for value in [0u8, 7] {
      let data = [value; 6];
      let decision = decoder.decode(&OutputTensor::flat(TensorSlice::UInt8(&data))).unwrap();
      assert_eq!(decision.class_and_score(), (6, 0.0));
      assert_eq!(decision.fallback(), Some(Fallback::DegenerateScores));
    }
  }

  #[test]
  fn single_class_is_degenerate_only_when_zero() {
    assert_eq!(argmax([0.3], 1).class_index, 0);
    assert_eq!(argmax([0.0], 1).class_index, 1);
  }

  #[test]
  fn decoding_is_idempotent() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let mut data = record([0.1; 4], 0.35, &[0.3, 0.1, 0.2, 0.9, 0.0]);
    data.extend(record([0.2; 4], 0.75, &[0.1, 0.1, 0.6, 0.1, 0.1]));
    let tensor = detector_tensor(&data, 10);
    assert_eq!(decoder.decode(&tensor).unwrap(), decoder.decode(&tensor).unwrap());
  }

  #[test]
  fn malformed_tensor_produces_no_decision() {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    let data = vec![0.5f32; 25];
    let err = decoder
      .decode(&OutputTensor::flat(TensorSlice::Float32(&data)))
      .unwrap_err();
    assert_eq!(
      err,
      DecodeError::ShapeMismatch(ShapeMismatch::NotDivisible {
        element_count: 25,
        record_width: 10
      })
    );
  }

  #[test]
  fn padded_records_step_by_record_width() {
    // 每条记录末尾有 2 个填充元素
    let config = DecoderConfig::single_best(3).record_width(10);
    let decoder = Decoder::new(config).unwrap();
    let mut data = record([0.0; 4], 0.2, &[1.0, 0.0, 0.0]);
    data.extend([9.0, 9.0]);
    data.extend(record([0.0; 4], 0.8, &[0.0, 0.5, 0.0]));
    data.extend([9.0, 9.0]);
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 10)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.candidate, Some(1));
    assert_eq!(d.class_index, 1);
    assert!((d.confidence - 0.4).abs() < EPS);
  }

  #[test]
  fn headerless_records_have_no_box() {
    let config = DecoderConfig::single_best(2).objectness_offset(0);
    let decoder = Decoder::new(config).unwrap();
    let data = [0.5f32, 0.2, 0.6, 0.9, 0.9, 0.1];
    let Decision::Detection(d) = decoder.decode(&detector_tensor(&data, 3)).unwrap() else {
      panic!("expected a detection");
    };
    assert_eq!(d.candidate, Some(1));
    assert_eq!(d.class_index, 0);
    assert_eq!(d.bbox, [0.0; 4]);
  }
}
