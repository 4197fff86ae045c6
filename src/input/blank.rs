// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/input/blank.rs - 空白帧输入，配合回放运行时使用
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
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

#[derive(Error, Debug)]
pub enum BlankInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Invalid frame count: {0}")]
  InvalidCount(String),
}

/// 产生全零帧；`blank:?count=N` 限定帧数，缺省为无限
#[derive(Debug, Default)]
pub struct BlankInput<const W: u32, const H: u32> {
  remaining: Option<usize>,
}

impl<const W: u32, const H: u32> BlankInput<W, H> {
  pub fn with_count(count: Option<usize>) -> Self {
    Self { remaining: count }
  }
}

impl<const W: u32, const H: u32> FromUrlWithScheme for BlankInput<W, H> {
  const SCHEME: &'static str = "blank";
}

impl<const W: u32, const H: u32> FromUrl for BlankInput<W, H> {
  type Error = BlankInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(BlankInputError::SchemaMismatch);
    }

    let mut remaining = None;
    for (k, v) in url.query_pairs() {
      if k == "count" {
        remaining = Some(
          v.parse()
            .map_err(|_| BlankInputError::InvalidCount(v.to_string()))?,
        );
      }
    }
    Ok(Self { remaining })
  }
}

impl<const W: u32, const H: u32> Iterator for BlankInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    match self.remaining.as_mut() {
      Some(0) => None,
      Some(n) => {
        *n -= 1;
        Some(RgbNhwcFrame::default())
      }
      None => Some(RgbNhwcFrame::default()),
    }
  }
}
