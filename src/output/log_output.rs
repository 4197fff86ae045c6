// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/output/log_output.rs - 日志输出
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

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::Decision,
  output::Render,
  task::{FrameOutcome, FrameReport},
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 把每帧的决策写入日志，`log:`；`log:?maxima` 同时打印逐类别最大值
#[derive(Debug, Default)]
pub struct LogOutput {
  maxima: bool,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch);
    }
    let maxima = url.query_pairs().any(|(k, _)| k == "maxima");
    Ok(LogOutput { maxima })
  }
}

impl<Frame> Render<Frame, FrameReport> for LogOutput {
  type Error = LogOutputError;

  fn render_result(&self, _frame: &Frame, result: &FrameReport) -> Result<(), Self::Error> {
    let label = result.label.as_deref().unwrap_or("-");
    match &result.outcome {
      FrameOutcome::Decided(decision) => {
        let (_, score) = decision.class_and_score();
        info!(
          "帧 {} (耗时: {:.2?}): {} {:.4}",
          result.frame_index, result.elapsed, label, score
        );
        if let Some(fallback) = decision.fallback() {
          info!("  {}", fallback);
        }
        if let (true, Decision::ClassMaxima(m)) = (self.maxima, decision) {
          for (class_index, max) in m.maxima.iter().enumerate() {
            info!("  class{}: {:.4}", class_index, max);
          }
        }
      }
      FrameOutcome::Dropped(reason) => {
        warn!(
          "帧 {} (耗时: {:.2?}) 已丢弃: {}",
          result.frame_index, result.elapsed, reason
        );
      }
    }
    Ok(())
  }
}
