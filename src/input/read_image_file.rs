// 该文件是 Lupai （路牌识读） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decoded_path, frame::RgbNhwcFrame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Invalid repeat count: {0}")]
  InvalidRepeat(String),
}

/// 读取一张图片并缩放到模型输入尺寸；`?repeat=N` 重复产出 N 次
pub struct ImageFileInput<const W: u32, const H: u32> {
  frame: RgbNhwcFrame<W, H>,
  remaining: usize,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for ImageFileInput<W, H> {
  const SCHEME: &'static str = "image";
}

impl<const W: u32, const H: u32> FromUrl for ImageFileInput<W, H> {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let mut remaining = 1;
    for (k, v) in url.query_pairs() {
      if k == "repeat" {
        remaining = v
          .parse()
          .map_err(|_| ImageFileInputError::InvalidRepeat(v.to_string()))?;
      }
    }

    let path = decoded_path(url);
    let image = ImageReader::open(&path)?.decode()?.into_rgb8();
    debug!("读取图片 {}: {}x{}", path, image.width(), image.height());

    Ok(ImageFileInput {
      frame: rgb_image_to_frame(&image),
      remaining,
    })
  }
}

/// 缩放到 `W x H` 后按 NHWC 排列
pub(crate) fn rgb_image_to_frame<const W: u32, const H: u32>(
  image: &RgbImage,
) -> RgbNhwcFrame<W, H> {
  let resized = if image.dimensions() == (W, H) {
    image.clone()
  } else {
    image::imageops::resize(image, W, H, FilterType::Triangle)
  };

  let mut frame = RgbNhwcFrame::<W, H>::default();
  frame.as_mut().copy_from_slice(resized.as_raw());
  frame
}

impl<const W: u32, const H: u32> Iterator for ImageFileInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.remaining == 0 {
      return None;
    }
    self.remaining -= 1;
    Some(self.frame.clone())
  }
}
