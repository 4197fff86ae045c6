// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/input/v4l_input.rs - V4L 摄像头输入
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

use image::RgbImage;
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;
use v4l::{
  Device, FourCC, buffer::Type, io::mmap::Stream, io::traits::CaptureStream, video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path, frame::RgbNhwcFrame,
  input::read_image_file::rgb_image_to_frame,
};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
}

const RGB24: &[u8; 4] = b"RGB3";
const CAPTURE_BUFFERS: u32 = 4;

/// 从 V4L 设备采集 RGB24 帧，`v4l:///dev/video0`
///
/// 设备与捕获流在构造时打开一次，之后每帧只从流中取缓冲区。
pub struct V4lInput<const W: u32, const H: u32> {
  /// 捕获流借用 device，必须先于 device 释放
  stream: Option<Stream<'static>>,
  _device: Pin<Box<Device>>,
  width: u32,
  height: u32,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for V4lInput<W, H> {
  const SCHEME: &'static str = "v4l";
}

impl<const W: u32, const H: u32> FromUrl for V4lInput<W, H> {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let device_path = match decoded_path(url) {
      path if path.is_empty() => "/dev/video0".to_string(),
      path => path,
    };

    let device = Box::pin(Device::with_path(&device_path)?);
    let mut format = device.format()?;
    format.fourcc = FourCC::new(RGB24);
    format.width = W;
    format.height = H;
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(RGB24) {
      return Err(V4lInputError::UnsupportedPixelFormat(format.fourcc.to_string()));
    }
    debug!(
      "摄像头 {} 格式: {}x{} {}",
      device_path, format.width, format.height, format.fourcc
    );

    let mut input = V4lInput {
      stream: None,
      _device: device,
      width: format.width,
      height: format.height,
    };

    // SAFETY: device 固定在堆上且不会移动；stream 与它存放在同一个结构体中，
    // 并在 Drop 中先于 device 释放。
    let stream = unsafe {
      let device: &Device = &input._device;
      let device: &'static Device = std::mem::transmute::<&Device, &'static Device>(device);
      Stream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)?
    };
    input.stream = Some(stream);
    Ok(input)
  }
}

impl<const W: u32, const H: u32> V4lInput<W, H> {
  fn capture_frame(&mut self) -> Result<Option<RgbNhwcFrame<W, H>>, V4lInputError> {
    let Some(stream) = self.stream.as_mut() else {
      return Ok(None);
    };
    let (buf, _meta) = stream.next()?;

    let expected = (self.width * self.height * 3) as usize;
    if buf.len() < expected {
      return Err(V4lInputError::UnsupportedPixelFormat(format!(
        "缓冲区长度 {} 小于 {}",
        buf.len(),
        expected
      )));
    }

    let image = RgbImage::from_raw(self.width, self.height, buf[..expected].to_vec())
      .ok_or_else(|| V4lInputError::UnsupportedPixelFormat("无法构造 RGB 图像".to_string()))?;
    Ok(Some(rgb_image_to_frame(&image)))
  }
}

impl<const W: u32, const H: u32> Drop for V4lInput<W, H> {
  fn drop(&mut self) {
    self.stream.take();
  }
}

impl<const W: u32, const H: u32> Iterator for V4lInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    match self.capture_frame() {
      Ok(frame) => frame,
      Err(e) => {
        error!("Failed to capture frame: {}", e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_device_fails_at_construction() {
    let url = Url::parse("v4l:///dev/lupai-no-such-camera").unwrap();
    assert!(matches!(
      V4lInput::<4, 4>::from_url(&url),
      Err(V4lInputError::IoError(_))
    ));

    let url = Url::parse("blank:").unwrap();
    assert!(matches!(
      V4lInput::<4, 4>::from_url(&url),
      Err(V4lInputError::SchemaMismatch)
    ));
  }
}
