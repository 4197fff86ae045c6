// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/task.rs - 采集、推理、解码、输出循环
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

use std::{
  thread,
  time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
  model::{DecodeError, Decision, Decoder, LabelSet},
  output::Render,
  runtime::Inference,
};

/// 诊断用帧计数，每采集一帧加一，包括被丢弃的帧
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
  count: u64,
}

impl FrameCounter {
  pub fn advance(&mut self) -> u64 {
    self.count = self.count.wrapping_add(1);
    self.count
  }

  pub fn count(&self) -> u64 {
    self.count
  }
}

/// 从采集前开始计时，到决策产生为止；只用于诊断
#[derive(Debug, Clone, Copy)]
pub struct FrameTimer {
  started: Instant,
}

impl FrameTimer {
  pub fn start() -> Self {
    Self {
      started: Instant::now(),
    }
  }

  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameDrop {
  ShapeMismatch(DecodeError),
  InferenceFailed(String),
}

impl std::fmt::Display for FrameDrop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FrameDrop::ShapeMismatch(e) => write!(f, "{}", e),
      FrameDrop::InferenceFailed(e) => write!(f, "推理失败: {}", e),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
  Decided(Decision),
  Dropped(FrameDrop),
}

/// 交给输出端的一帧结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
  pub frame_index: u64,
  pub elapsed: Duration,
  /// 最终类别的标签名，丢弃的帧为 `None`
  pub label: Option<String>,
  pub outcome: FrameOutcome,
}

impl FrameReport {
  pub fn decision(&self) -> Option<&Decision> {
    match &self.outcome {
      FrameOutcome::Decided(decision) => Some(decision),
      FrameOutcome::Dropped(_) => None,
    }
  }
}

/// 各类别的决策次数统计，只用于任务结束时的汇总日志
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionTally {
  per_class: Vec<u64>,
  sentinel: u64,
  dropped: u64,
}

impl DecisionTally {
  pub fn new(num_classes: usize) -> Self {
    Self {
      per_class: vec![0; num_classes],
      sentinel: 0,
      dropped: 0,
    }
  }

  pub fn record(&mut self, report: &FrameReport) {
    let Some(decision) = report.decision() else {
      self.dropped += 1;
      return;
    };
    let (class_index, _) = decision.class_and_score();
    match self.per_class.get_mut(class_index) {
      Some(count) => *count += 1,
      None => self.sentinel += 1,
    }
  }

  pub fn class_count(&self, class_index: usize) -> u64 {
    self.per_class.get(class_index).copied().unwrap_or(0)
  }

  pub fn sentinel(&self) -> u64 {
    self.sentinel
  }

  pub fn dropped(&self) -> u64 {
    self.dropped
  }

  pub fn total(&self) -> u64 {
    self.per_class.iter().sum::<u64>() + self.sentinel + self.dropped
  }

  pub fn log_summary(&self, labels: LabelSet) {
    info!("总帧数: {}", self.total());
    for (class_index, count) in self.per_class.iter().enumerate() {
      info!(
        "  {}: {}",
        labels.to_label_str(class_index, self.per_class.len()),
        count
      );
    }
    info!("  无有效类别: {}", self.sentinel);
    if self.dropped > 0 {
      warn!("  丢弃帧: {}", self.dropped);
    }
  }
}

/// 推理运行时加解码器，每次处理一帧
pub struct Pipeline<R> {
  runtime: R,
  decoder: Decoder,
  counter: FrameCounter,
  tally: DecisionTally,
}

impl<R: Inference> Pipeline<R>
where
  R::Error: std::fmt::Display,
{
  pub fn new(runtime: R, decoder: Decoder) -> Self {
    let tally = DecisionTally::new(decoder.config().num_classes());
    Self {
      runtime,
      decoder,
      counter: FrameCounter::default(),
      tally,
    }
  }

  pub fn decoder(&self) -> &Decoder {
    &self.decoder
  }

  pub fn counter(&self) -> FrameCounter {
    self.counter
  }

  pub fn tally(&self) -> &DecisionTally {
    &self.tally
  }

  pub fn into_tally(self) -> DecisionTally {
    self.tally
  }

  /// 采集一帧并处理；输入耗尽时返回 `None`
  pub fn next_frame<I>(&mut self, input: &mut I) -> Option<(R::Input, FrameReport)>
  where
    I: Iterator<Item = R::Input>,
  {
    let timer = FrameTimer::start();
    let frame = input.next()?;
    let report = self.process(&frame, timer);
    Some((frame, report))
  }

  /// 推理并解码一帧。任何单帧错误都只会让这一帧被丢弃
  pub fn process(&mut self, frame: &R::Input, timer: FrameTimer) -> FrameReport {
    let outcome = match self.runtime.infer(frame) {
      Ok(tensor) => match self.decoder.decode(&tensor) {
        Ok(decision) => FrameOutcome::Decided(decision),
        Err(e) => FrameOutcome::Dropped(FrameDrop::ShapeMismatch(e)),
      },
      Err(e) => {
        error!("推理失败: {}", e);
        FrameOutcome::Dropped(FrameDrop::InferenceFailed(e.to_string()))
      }
    };
    let elapsed = timer.elapsed();
    let frame_index = self.counter.advance();

    let config = self.decoder.config();
    let label = match &outcome {
      FrameOutcome::Decided(decision) => Some(
        config
          .get_labels()
          .to_label_str(decision.class_and_score().0, config.num_classes()),
      ),
      FrameOutcome::Dropped(_) => None,
    };

    let report = FrameReport {
      frame_index,
      elapsed,
      label,
      outcome,
    };
    self.tally.record(&report);
    debug!("第 {} 帧处理完成，耗时: {:.2?}", frame_index, elapsed);
    report
  }
}

pub trait Task<I, R, O>: Sized {
  type Error;
  fn run_task(
    self,
    input: I,
    pipeline: Pipeline<R>,
    output: O,
  ) -> Result<DecisionTally, Self::Error>;
}

pub struct OneShotTask;

impl<
  F,
  RE: std::fmt::Display,
  OE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  R: Inference<Input = F, Error = RE>,
  O: Render<F, FrameReport, Error = OE>,
> Task<I, R, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: Pipeline<R>,
    output: O,
  ) -> Result<DecisionTally, Self::Error> {
    info!("开始任务...");
    let (frame, report) = pipeline
      .next_frame(&mut input)
      .ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("处理完成，耗时: {:.2?}", report.elapsed);
    output.render_result(&frame, &report)?;
    Ok(pipeline.into_tally())
  }
}

/// 同一帧重复推理与解码，用于测量耗时
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times;
    self
  }
}

impl<
  F,
  RE: std::fmt::Display,
  OE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  R: Inference<Input = F, Error = RE>,
  O: Render<F, FrameReport, Error = OE>,
> Task<I, R, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: Pipeline<R>,
    output: O,
  ) -> Result<DecisionTally, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let mut times = Vec::with_capacity(self.times);
    for i in 0..self.times {
      let report = pipeline.process(&frame, FrameTimer::start());
      info!("({})处理完成，耗时: {:.2?}", i, report.elapsed);
      output.render_result(&frame, &report)?;
      times.push(report.elapsed);
    }

    // 前两次包含预热
    let warm = if times.len() > 2 { &times[2..] } else { &times[..] };
    if !warm.is_empty() {
      warn!(
        "平均处理时间: {:.2?}",
        warm.iter().sum::<Duration>() / warm.len() as u32
      );
    }

    Ok(pipeline.into_tally())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<
  F,
  RE: std::fmt::Display,
  OE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  R: Inference<Input = F, Error = RE>,
  O: Render<F, FrameReport, Error = OE>,
> Task<I, R, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: Pipeline<R>,
    output: O,
  ) -> Result<DecisionTally, Self::Error> {
    info!("开始任务...");
    let (tx, rx) = std::sync::mpsc::channel();

    let handler = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    if let Err(e) = handler {
      warn!("无法设置 Ctrl-C 处理: {}", e);
    }

    while let Some((frame, report)) = pipeline.next_frame(&mut input) {
      output.render_result(&frame, &report)?;
      if self
        .frame_number
        .map(|n| report.frame_index >= n)
        .unwrap_or(false)
      {
        info!("达到指定帧数 {}, 退出任务循环", report.frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，退出");
    Ok(pipeline.into_tally())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DecoderConfig;
  use crate::tensor::{OutputTensor, TensorSlice};

  /// 每次推理发布固定数据的运行时
  struct FixedRuntime {
    data: Vec<f32>,
    shape: Vec<usize>,
    fail: bool,
  }

  impl Inference for FixedRuntime {
    type Input = ();
    type Error = String;

    fn infer(&mut self, _input: &()) -> Result<OutputTensor<'_>, String> {
      if self.fail {
        return Err("invoke failed".to_string());
      }
      OutputTensor::new(TensorSlice::Float32(&self.data), &self.shape).map_err(|e| e.to_string())
    }
  }

  fn pipeline(data: Vec<f32>, shape: Vec<usize>, fail: bool) -> Pipeline<FixedRuntime> {
    let decoder = Decoder::new(DecoderConfig::single_best(5)).unwrap();
    Pipeline::new(FixedRuntime { data, shape, fail }, decoder)
  }

  #[test]
  fn counter_advances_for_dropped_frames() {
    let mut p = pipeline(vec![0.0; 25], vec![25], false);
    let mut input = std::iter::repeat_n((), 3);
    let mut indices = Vec::new();
    while let Some((_, report)) = p.next_frame(&mut input) {
      assert!(matches!(
        report.outcome,
        FrameOutcome::Dropped(FrameDrop::ShapeMismatch(_))
      ));
      assert_eq!(report.label, None);
      indices.push(report.frame_index);
    }
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(p.tally().dropped(), 3);

    let mut p = pipeline(vec![], vec![0], true);
    let (_, report) = p.next_frame(&mut std::iter::once(())).unwrap();
    assert!(matches!(
      report.outcome,
      FrameOutcome::Dropped(FrameDrop::InferenceFailed(_))
    ));
    assert_eq!(p.counter().count(), 1);
  }

  #[test]
  fn decided_frame_carries_label_and_tally() {
    let data = vec![0.0, 0.0, 0.0, 0.0, 0.9, 0.1, 0.8, 0.05, 0.05, 0.0];
    let mut p = pipeline(data, vec![1, 1, 10], false);
    let (_, report) = p.next_frame(&mut std::iter::once(())).unwrap();
    assert_eq!(report.frame_index, 1);
    assert_eq!(report.label.as_deref(), Some("1"));
    assert_eq!(report.decision().unwrap().class_and_score().0, 1);
    assert_eq!(p.tally().class_count(1), 1);
    assert_eq!(p.tally().total(), 1);
    assert!(p.next_frame(&mut std::iter::empty()).is_none());
    assert_eq!(p.counter().count(), 1);
  }

  #[test]
  fn sentinel_decisions_are_tallied_separately() {
    let mut tally = DecisionTally::new(5);
    let mut p = pipeline(vec![], vec![1, 0, 10], false);
    let (_, report) = p.next_frame(&mut std::iter::once(())).unwrap();
    assert_eq!(report.label.as_deref(), Some("none"));
    tally.record(&report);
    assert_eq!(tally.sentinel(), 1);
    assert_eq!(tally.total(), 1);
  }

  #[test]
  fn counter_wraps_instead_of_overflowing() {
    let mut counter = FrameCounter { count: u64::MAX };
    assert_eq!(counter.advance(), 0);
  }
}
