// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/runtime/rknn.rs - RKNN NPU 推理运行时
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

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::Inference;
use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  frame::RgbNhwcFrame,
  input::AsNhwcFrame,
  tensor::{OutputTensor, TensorSlice},
};

const RKNN_NUM_INPUTS: u32 = 1;
const RKNN_NUM_OUTPUTS: u32 = 1;

#[derive(Error, Debug)]
pub enum RknnRuntimeError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl RknnRuntimeError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnRuntimeError::ModelInvalid(msg.to_string(), e)
  }
}

/// 单输入单输出模型，输出按 float32 读取
pub struct RknnRuntime<Frame> {
  context: Context,
  output: Option<rknpu::Output>,
  _phantom: std::marker::PhantomData<Frame>,
}

pub struct RknnRuntimeBuilder {
  model_path: String,
  flags: InitFlags,
}

impl FromUrlWithScheme for RknnRuntimeBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnRuntimeBuilder {
  type Error = RknnRuntimeError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnRuntimeError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(RknnRuntimeBuilder {
      model_path: decoded_path(url),
      flags: InitFlags::default(),
    })
  }
}

impl RknnRuntimeBuilder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build<Frame>(self) -> Result<RknnRuntime<Frame>, RknnRuntimeError> {
    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} KB",
      model_data.len() as f64 / 1024.0
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnRuntimeError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnRuntimeError::invalid("无法获取输出数量", e))?;

    if num_inputs != RKNN_NUM_INPUTS || num_outputs != RKNN_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RKNN_NUM_INPUTS, RKNN_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnRuntimeError::invalid(&msg, rknpu::Error::InvalidModel));
    }
    info!("模型加载完成");

    Ok(RknnRuntime {
      context,
      output: None,
      _phantom: std::marker::PhantomData,
    })
  }
}

impl<const W: u32, const H: u32> Inference for RknnRuntime<RgbNhwcFrame<W, H>> {
  type Input = RgbNhwcFrame<W, H>;
  type Error = RknnRuntimeError;

  fn infer(&mut self, input: &Self::Input) -> Result<OutputTensor<'_>, Self::Error> {
    debug!("设置模型输入");
    self.context.set_input(
      0,
      input.as_nhwc(),
      rknpu::TensorFormat::NHWC,
      TensorType::UInt8,
    )?;

    debug!("执行模型推理");
    self.context.run()?;

    // 上一帧的输出在这里被替换，视图只能活到下一次推理
    let output = self.output.insert(self.context.get_outputs()?);
    let data = output.get_f32(0)?;
    debug!("模型输出元素数量: {}", data.len());
    Ok(OutputTensor::flat(TensorSlice::Float32(data)))
  }
}
