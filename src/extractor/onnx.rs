// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/extractor/onnx.rs - 基于 ONNX Runtime 的特征提取器
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

use std::{fmt::Display, path::PathBuf, time::Instant};

use image::{
  ImageBuffer, Rgb,
  imageops::{self, FilterType},
};
use ndarray::Array4;
use ort::{
  session::{Session, builder::SessionBuilder},
  value::TensorRef,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{CoderConfig, ComputeMode},
  extractor::{Extraction, ExtractionError, FeatureExtractor, Timings},
  frame::BgrFrame,
};

#[derive(Error, Debug)]
pub enum OnnxExtractorError {
  #[error("网络结构文件不存在: {0}")]
  TopologyNotFound(PathBuf),
  #[error("权重文件不存在: {0}")]
  WeightsNotFound(PathBuf),
  #[error("ONNX Runtime 错误: {0}")]
  RuntimeError(String),
  #[error("模型没有输入")]
  NoInput,
}

fn runtime_error<E: Display>(err: E) -> OnnxExtractorError {
  OnnxExtractorError::RuntimeError(err.to_string())
}

fn inference_error<E: Display>(err: E) -> ExtractionError {
  ExtractionError::Inference(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Preprocess {
  resize: (u32, u32),
  crop: (u32, u32),
  mean: [f32; 3],
  scale: f32,
}

impl Preprocess {
  /// 缩放、中心裁剪、减均值，输出 1x3xHxW 张量，通道顺序保持 BGR
  fn to_tensor(&self, frame: &BgrFrame) -> Result<Array4<f32>, ExtractionError> {
    let image: ImageBuffer<Rgb<u8>, Vec<u8>> =
      ImageBuffer::from_raw(frame.width(), frame.height(), frame.as_ref().to_vec()).ok_or_else(
        || {
          ExtractionError::InvalidFrame(format!(
            "无法构造 {}x{} 图像",
            frame.width(),
            frame.height()
          ))
        },
      )?;

    let (resize_w, resize_h) = self.resize;
    let (crop_w, crop_h) = self.crop;
    let resized = imageops::resize(&image, resize_w, resize_h, FilterType::Triangle);
    let x = resize_w.saturating_sub(crop_w) / 2;
    let y = resize_h.saturating_sub(crop_h) / 2;
    let cropped = imageops::crop_imm(&resized, x, y, crop_w, crop_h).to_image();

    let mut tensor = Array4::<f32>::zeros((1, 3, crop_h as usize, crop_w as usize));
    for (x, y, pixel) in cropped.enumerate_pixels() {
      for c in 0..3 {
        tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - self.mean[c]) * self.scale;
      }
    }
    Ok(tensor)
  }
}

pub struct OnnxExtractorBuilder {
  topology: PathBuf,
  weights: Option<PathBuf>,
  blob_name: String,
  compute_mode: ComputeMode,
  device_id: i32,
  preprocess: Preprocess,
}

impl OnnxExtractorBuilder {
  pub fn from_config(config: &CoderConfig) -> Self {
    Self {
      topology: config.topology_path(),
      weights: config.weights_path(),
      blob_name: config.blob_name.clone(),
      compute_mode: config.compute_mode,
      device_id: config.device_id,
      preprocess: Preprocess {
        resize: (config.resize_width, config.resize_height),
        crop: (config.crop_width, config.crop_height),
        mean: config.mean,
        scale: config.scale,
      },
    }
  }

  #[cfg(feature = "cuda")]
  fn with_gpu(builder: SessionBuilder, device_id: i32) -> Result<SessionBuilder, OnnxExtractorError> {
    info!("使用 CUDA 设备 {}", device_id);
    let cuda = ort::execution_providers::CUDAExecutionProvider::default()
      .with_device_id(device_id)
      .build();
    builder
      .with_execution_providers([cuda])
      .map_err(runtime_error)
  }

  #[cfg(not(feature = "cuda"))]
  fn with_gpu(builder: SessionBuilder, device_id: i32) -> Result<SessionBuilder, OnnxExtractorError> {
    warn!("未启用 cuda 特性, 无法使用 GPU {}, 改用 CPU", device_id);
    Ok(builder)
  }

  pub fn build(self) -> Result<OnnxExtractor, OnnxExtractorError> {
    info!("网络结构文件: {}", self.topology.display());
    if !self.topology.is_file() {
      return Err(OnnxExtractorError::TopologyNotFound(self.topology));
    }
    if let Some(weights) = &self.weights {
      info!("权重文件: {}", weights.display());
      if !weights.is_file() {
        return Err(OnnxExtractorError::WeightsNotFound(weights.clone()));
      }
      if weights.parent() != self.topology.parent() {
        warn!("权重文件与网络结构文件不在同一目录, ONNX Runtime 可能无法找到外部数据");
      }
    }

    let builder = Session::builder().map_err(runtime_error)?;
    let builder = match self.compute_mode {
      ComputeMode::Gpu => Self::with_gpu(builder, self.device_id)?,
      ComputeMode::Cpu => builder,
    };
    let session = builder
      .commit_from_file(&self.topology)
      .map_err(runtime_error)?;

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .ok_or(OnnxExtractorError::NoInput)?;
    let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    debug!("模型输入: {}, 模型输出: {:?}", input_name, output_names);
    if !output_names.contains(&self.blob_name) {
      warn!(
        "模型中不存在输出层 {}, 可用输出: {:?}",
        self.blob_name, output_names
      );
    }

    info!("提取层: {}", self.blob_name);
    Ok(OnnxExtractor {
      session,
      input_name,
      output_names,
      blob_name: self.blob_name,
      preprocess: self.preprocess,
    })
  }
}

pub struct OnnxExtractor {
  session: Session,
  input_name: String,
  output_names: Vec<String>,
  blob_name: String,
  preprocess: Preprocess,
}

impl FeatureExtractor for OnnxExtractor {
  fn extract(&mut self, frame: &BgrFrame) -> Result<Extraction, ExtractionError> {
    if !self.output_names.contains(&self.blob_name) {
      return Err(ExtractionError::MissingOutput(self.blob_name.clone()));
    }

    let now = Instant::now();
    let tensor = self.preprocess.to_tensor(frame)?;
    let prep = now.elapsed();

    let now = Instant::now();
    let input = TensorRef::from_array_view(tensor.view()).map_err(inference_error)?;
    let outputs = self
      .session
      .run(ort::inputs![self.input_name.as_str() => input])
      .map_err(inference_error)?;
    let (_, data) = outputs[self.blob_name.as_str()]
      .try_extract_tensor::<f32>()
      .map_err(inference_error)?;
    let code = data.to_vec();
    let net = now.elapsed();

    Ok(Extraction {
      code,
      timings: Timings { prep, net },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::RgbFrame;

  fn preprocess() -> Preprocess {
    Preprocess {
      resize: (4, 4),
      crop: (2, 2),
      mean: [10.0, 20.0, 30.0],
      scale: 0.5,
    }
  }

  #[test]
  fn tensor_is_cropped_nchw_minus_mean() {
    // 纯色图像缩放后像素不变
    let data = [30u8, 20, 10].repeat(8 * 8);
    let frame = RgbFrame::new(8, 8, data).unwrap().to_bgr();
    let tensor = preprocess().to_tensor(&frame).unwrap();

    assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
    assert!(tensor.iter().all(|&v| v == 0.0));
  }

  #[test]
  fn missing_topology_is_reported() {
    let config = CoderConfig {
      topology_file: Some(PathBuf::from("/nonexistent/net.onnx")),
      ..Default::default()
    };
    let err = OnnxExtractorBuilder::from_config(&config).build().err();
    assert!(matches!(err, Some(OnnxExtractorError::TopologyNotFound(_))));
  }
}
