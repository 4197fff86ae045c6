// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/output/json_record.rs - JSON Lines 记录输出
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

use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  model::Decision,
  output::Render,
  task::{FrameOutcome, FrameReport},
};

#[derive(Error, Debug)]
pub enum JsonRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("记录文件锁已损坏")]
  Poisoned,
}

#[derive(Serialize)]
struct Record<'a> {
  time: String,
  frame: u64,
  elapsed_us: u64,
  label: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  decision: Option<&'a Decision>,
  #[serde(skip_serializing_if = "Option::is_none")]
  dropped: Option<String>,
}

/// 每帧追加一行 JSON，`jsonl:///var/log/lupai/frames.jsonl`
pub struct JsonRecordOutput {
  path: PathBuf,
  file: Mutex<File>,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonRecordOutputError::SchemeMismatch);
    }

    let path = PathBuf::from(decoded_path(uri));
    if let Some(directory) = path.parent() {
      if !directory.as_os_str().is_empty() && !directory.exists() {
        std::fs::create_dir_all(directory)?;
      }
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("记录文件: {}", path.display());

    Ok(JsonRecordOutput {
      path,
      file: Mutex::new(file),
    })
  }
}

impl JsonRecordOutput {
  pub fn path(&self) -> &PathBuf {
    &self.path
  }
}

impl<Frame> Render<Frame, FrameReport> for JsonRecordOutput {
  type Error = JsonRecordOutputError;

  fn render_result(&self, _frame: &Frame, result: &FrameReport) -> Result<(), Self::Error> {
    let (decision, dropped) = match &result.outcome {
      FrameOutcome::Decided(decision) => (Some(decision), None),
      FrameOutcome::Dropped(reason) => (None, Some(reason.to_string())),
    };
    let record = Record {
      time: Utc::now().to_rfc3339(),
      frame: result.frame_index,
      elapsed_us: result.elapsed.as_micros() as u64,
      label: result.label.as_deref(),
      decision,
      dropped,
    };

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');
    let mut file = self
      .file
      .lock()
      .map_err(|_| JsonRecordOutputError::Poisoned)?;
    file.write_all(&line)?;
    file.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Classification, DecodeError, ShapeMismatch};
  use crate::task::FrameDrop;
  use std::time::Duration;

  #[test]
  fn appends_one_line_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("frames.jsonl");
    let url = url::Url::parse(&format!("jsonl://{}", path.display())).unwrap();
    let output = JsonRecordOutput::from_url(&url).unwrap();

    let decided = FrameReport {
      frame_index: 1,
      elapsed: Duration::from_millis(3),
      label: Some("stop".to_string()),
      outcome: FrameOutcome::Decided(Decision::Classification(Classification {
        class_index: 4,
        score: 0.5,
        fallback: None,
      })),
    };
    let dropped = FrameReport {
      frame_index: 2,
      elapsed: Duration::from_millis(1),
      label: None,
      outcome: FrameOutcome::Dropped(FrameDrop::ShapeMismatch(DecodeError::ShapeMismatch(
        ShapeMismatch::ClassCount {
          expected: 6,
          actual: 5,
        },
      ))),
    };
    output.render_result(&(), &decided).unwrap();
    output.render_result(&(), &dropped).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["frame"], 1);
    assert_eq!(lines[0]["label"], "stop");
    assert_eq!(lines[0]["decision"]["kind"], "classification");
    assert_eq!(lines[0]["decision"]["class_index"], 4);
    assert_eq!(lines[1]["label"], serde_json::Value::Null);
    assert!(lines[1]["dropped"].as_str().unwrap().contains('6'));
  }
}
