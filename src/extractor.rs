// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/extractor.rs - 特征提取器接口
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

use std::time::Duration;

use thiserror::Error;

use crate::frame::BgrFrame;

#[derive(Error, Debug)]
pub enum ExtractionError {
  #[error("输入帧无效: {0}")]
  InvalidFrame(String),
  #[error("模型输出 {0} 不存在")]
  MissingOutput(String),
  #[error("推理失败: {0}")]
  Inference(String),
}

/// 一次提取的耗时诊断
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
  pub prep: Duration,
  pub net: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
  pub code: Vec<f32>,
  pub timings: Timings,
}

/// 将一帧图像映射为定长特征向量的同步函数
///
/// 实现者可以在内部缓存缓冲区，但调用方把它当作无状态的函数使用：
/// 同一个提取器只会被串行调用。
pub trait FeatureExtractor: Send {
  fn extract(&mut self, frame: &BgrFrame) -> Result<Extraction, ExtractionError>;
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for Box<E> {
  fn extract(&mut self, frame: &BgrFrame) -> Result<Extraction, ExtractionError> {
    (**self).extract(frame)
  }
}

/// 发布与落盘使用的特征向量，按双精度保存
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
  pub fn new(values: Vec<f64>) -> Self {
    Self(values)
  }

  pub fn from_f32(values: &[f32]) -> Self {
    Self(values.iter().map(|&v| v as f64).collect())
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn values(&self) -> &[f64] {
    &self.0
  }

  pub fn byte_len(&self) -> usize {
    self.0.len() * size_of::<f64>()
  }

  /// 小端 f64 依次拼接，无头部、无分隔符
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(self.byte_len());
    for value in &self.0 {
      bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
  }

  /// [`FeatureVector::to_bytes`] 的逆过程，长度必须是 8 的倍数
  pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
    if bytes.len() % size_of::<f64>() != 0 {
      return None;
    }
    let values = bytes
      .chunks_exact(size_of::<f64>())
      .map(|chunk| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        f64::from_le_bytes(raw)
      })
      .collect();
    Some(Self(values))
  }
}

impl From<Vec<f64>> for FeatureVector {
  fn from(values: Vec<f64>) -> Self {
    Self(values)
  }
}

#[cfg(feature = "onnx_extractor")]
mod onnx;
#[cfg(feature = "onnx_extractor")]
pub use self::onnx::{OnnxExtractor, OnnxExtractorBuilder, OnnxExtractorError};
