// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/input.rs - 图像采集输入
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

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

pub trait AsNhwcFrame<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> &[u8];
}

mod blank;
pub use self::blank::{BlankInput, BlankInputError};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Blank input error: {0}")]
  BlankInputError(#[from] BlankInputError),
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper<const W: u32, const H: u32> {
  Blank(BlankInput<W, H>),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput<W, H>),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput<W, H>),
}

impl<const W: u32, const H: u32> FromUrl for InputWrapper<W, H> {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() == BlankInput::<W, H>::SCHEME {
      return Ok(InputWrapper::Blank(BlankInput::from_url(url)?));
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileInput::<W, H>::SCHEME {
        return Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      if url.scheme() == V4lInput::<W, H>::SCHEME {
        return Ok(InputWrapper::V4l(V4lInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl<const W: u32, const H: u32> Iterator for InputWrapper<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::Blank(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.next(),
    }
  }
}
