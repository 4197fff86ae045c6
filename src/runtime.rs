// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/runtime.rs - 推理运行时接口
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
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, tensor::OutputTensor};

/// 接收一帧输入缓冲区、执行模型并发布输出张量。
///
/// 返回的视图借用运行时自身，下一次推理前必须释放。
pub trait Inference {
  type Input;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<OutputTensor<'_>, Self::Error>;
}

mod replay;
pub use self::replay::{ReplayError, ReplayRuntime};

#[cfg(feature = "rknpu_runtime")]
mod rknn;
#[cfg(feature = "rknpu_runtime")]
pub use self::rknn::{RknnRuntime, RknnRuntimeBuilder, RknnRuntimeError};

#[derive(Error, Debug)]
pub enum RuntimeError {
  #[error("回放运行时错误: {0}")]
  ReplayError(#[from] ReplayError),
  #[cfg(feature = "rknpu_runtime")]
  #[error("RKNN 运行时错误: {0}")]
  RknnRuntimeError(#[from] RknnRuntimeError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum RuntimeWrapper<const W: u32, const H: u32> {
  Replay(ReplayRuntime<RgbNhwcFrame<W, H>>),
  #[cfg(feature = "rknpu_runtime")]
  Rknn(RknnRuntime<RgbNhwcFrame<W, H>>),
}

impl<const W: u32, const H: u32> FromUrl for RuntimeWrapper<W, H> {
  type Error = RuntimeError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == ReplayRuntime::<RgbNhwcFrame<W, H>>::SCHEME {
      return Ok(RuntimeWrapper::Replay(ReplayRuntime::from_url(url)?));
    }
    #[cfg(feature = "rknpu_runtime")]
    {
      if url.scheme() == RknnRuntimeBuilder::SCHEME {
        let runtime = RknnRuntimeBuilder::from_url(url)?.build()?;
        return Ok(RuntimeWrapper::Rknn(runtime));
      }
    }
    Err(RuntimeError::SchemeMismatch)
  }
}

impl<const W: u32, const H: u32> Inference for RuntimeWrapper<W, H> {
  type Input = RgbNhwcFrame<W, H>;
  type Error = RuntimeError;

  fn infer(&mut self, input: &Self::Input) -> Result<OutputTensor<'_>, Self::Error> {
    match self {
      RuntimeWrapper::Replay(runtime) => runtime.infer(input).map_err(RuntimeError::from),
      #[cfg(feature = "rknpu_runtime")]
      RuntimeWrapper::Rknn(runtime) => runtime.infer(input).map_err(RuntimeError::from),
    }
  }
}
