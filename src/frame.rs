// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/frame.rs - RGB/BGR 帧与消息信封定义
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

use chrono::{DateTime, Utc};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
}

fn expected_len(width: u32, height: u32) -> usize {
  RGB_CHANNELS * width as usize * height as usize
}

/// 交错排列 (HWC) 的 8 位 RGB 帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl RgbFrame {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = expected_len(width, height);
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 全零帧
  pub fn with_shape(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      data: vec![0u8; expected_len(width, height)].into_boxed_slice(),
    }
  }

  /// 0x0 帧，表示“什么都没收到”
  pub fn empty() -> Self {
    Self::with_shape(0, 0)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let offset = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
    [
      self.data[offset],
      self.data[offset + 1],
      self.data[offset + 2],
    ]
  }

  /// 交换 R/B 通道，得到特征提取器期望的 BGR 排列
  pub fn to_bgr(&self) -> BgrFrame {
    let mut data = self.data.clone();
    for pixel in data.chunks_exact_mut(RGB_CHANNELS) {
      pixel.swap(0, 2);
    }

    BgrFrame {
      width: self.width,
      height: self.height,
      data,
    }
  }
}

impl AsRef<[u8]> for RgbFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for RgbFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

/// 交错排列 (HWC) 的 8 位 BGR 帧，只由 [`RgbFrame::to_bgr`] 产生
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgrFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl BgrFrame {
  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }
}

impl AsRef<[u8]> for BgrFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

/// 消息信封：生产者附加的序号与时间戳
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
  pub count: u64,
  pub time: DateTime<Utc>,
}

impl Envelope {
  pub fn new(count: u64) -> Self {
    Self {
      count,
      time: Utc::now(),
    }
  }
}

/// 带可选信封的消息
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
  pub envelope: Option<Envelope>,
  pub payload: T,
}

impl<T> Stamped<T> {
  pub fn new(payload: T, envelope: Option<Envelope>) -> Self {
    Self { envelope, payload }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_wrong_buffer_length() {
    let err = RgbFrame::new(2, 2, vec![0; 11]).unwrap_err();
    assert_eq!(
      err,
      FrameError::SizeMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn zero_dimension_is_empty() {
    assert!(RgbFrame::empty().is_empty());
    assert!(RgbFrame::with_shape(0, 4).is_empty());
    assert!(RgbFrame::with_shape(4, 0).is_empty());
    assert!(!RgbFrame::with_shape(1, 1).is_empty());
  }

  #[test]
  fn to_bgr_swaps_red_and_blue() {
    let frame = RgbFrame::new(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
    let bgr = frame.to_bgr();
    assert_eq!(bgr.as_ref(), &[3, 2, 1, 6, 5, 4]);
    assert_eq!((bgr.width(), bgr.height()), (2, 1));
    // 原始帧保持不变
    assert_eq!(frame.pixel(1, 0), [4, 5, 6]);
  }
}
