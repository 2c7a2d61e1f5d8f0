// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/config.rs - 运行配置
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

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_NAME: &str = "featureCoder";
pub const DEFAULT_CONFIG_FILE: &str = "feature_coder.json";
pub const DEFAULT_TOPOLOGY_FILE: &str = "feature_net.onnx";
pub const DEFAULT_DUMP_FILE: &str = "codes.bin";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
  Cpu,
  #[default]
  Gpu,
}

/// 启动配置，启动后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderConfig {
  /// 进程名，同时是所有端口名的前缀
  pub name: String,
  /// 上下文名，决定默认的上下文目录
  pub context: String,
  /// 显式指定的上下文目录
  pub context_dir: Option<PathBuf>,
  /// 网络结构文件 (ONNX)，缺省为上下文目录下的 `feature_net.onnx`
  pub topology_file: Option<PathBuf>,
  /// 外部权重文件，需与结构文件位于同一目录
  pub weights_file: Option<PathBuf>,
  /// 要提取的输出层名
  pub blob_name: String,
  pub compute_mode: ComputeMode,
  pub device_id: i32,
  /// 是否打印每帧的预处理/推理耗时
  pub timing: bool,
  pub resize_width: u32,
  pub resize_height: u32,
  pub crop_width: u32,
  pub crop_height: u32,
  /// BGR 顺序的通道均值
  pub mean: [f32; 3],
  pub scale: f32,
  /// 最大处理帧率，0 表示不限制
  pub rate: f64,
  /// 启动即开始落盘的文件，相对路径基于上下文目录
  pub dump_code: Option<PathBuf>,
  pub append: bool,
}

impl Default for CoderConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_NAME.to_string(),
      context: DEFAULT_NAME.to_string(),
      context_dir: None,
      topology_file: None,
      weights_file: None,
      blob_name: "pool5".to_string(),
      compute_mode: ComputeMode::Gpu,
      device_id: 0,
      timing: false,
      resize_width: 256,
      resize_height: 256,
      crop_width: 224,
      crop_height: 224,
      mean: [104.0, 117.0, 123.0],
      scale: 1.0,
      rate: 0.0,
      dump_code: None,
      append: false,
    }
  }
}

impl CoderConfig {
  pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Self::from_json_str(&text)
  }

  /// 上下文目录：显式配置优先，其次是用户数据目录，最后是当前目录
  pub fn context_path(&self) -> PathBuf {
    if let Some(dir) = &self.context_dir {
      return dir.clone();
    }
    dirs::data_dir()
      .map(|dir| dir.join("feature-coder").join("contexts"))
      .unwrap_or_else(|| PathBuf::from("./contexts"))
      .join(&self.context)
  }

  /// 相对路径基于上下文目录解析
  pub fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.context_path().join(path)
    }
  }

  pub fn topology_path(&self) -> PathBuf {
    match &self.topology_file {
      Some(path) => self.resolve(path),
      None => self.resolve(DEFAULT_TOPOLOGY_FILE),
    }
  }

  pub fn weights_path(&self) -> Option<PathBuf> {
    self.weights_file.as_ref().map(|path| self.resolve(path))
  }

  pub fn default_dump_path(&self) -> PathBuf {
    self.resolve(DEFAULT_DUMP_FILE)
  }

  /// 两帧之间的最小间隔，`rate` 为 0 时不限制。间隔超出 `Duration` 范围时取最大值。
  pub fn min_interval(&self) -> Option<Duration> {
    if self.rate > 0.0 {
      Some(Duration::try_from_secs_f64(1.0 / self.rate).unwrap_or(Duration::MAX))
    } else {
      None
    }
  }

  pub fn input_port(&self) -> String {
    format!("/{}/img:i", self.name)
  }

  pub fn image_port(&self) -> String {
    format!("/{}/img:o", self.name)
  }

  pub fn code_port(&self) -> String {
    format!("/{}/code:o", self.name)
  }

  pub fn rpc_port(&self) -> String {
    format!("/{}/rpc", self.name)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.name.is_empty() || self.name.contains(char::is_whitespace) {
      return Err(ConfigError::Invalid(format!("名称无效: {:?}", self.name)));
    }
    if !self.rate.is_finite() || self.rate < 0.0 {
      return Err(ConfigError::Invalid(format!(
        "帧率必须为非负有限值, 实际为 {}",
        self.rate
      )));
    }
    if self.rate > 0.0 && Duration::try_from_secs_f64(1.0 / self.rate).is_err() {
      return Err(ConfigError::Invalid(format!("帧率过小: {}", self.rate)));
    }
    if self.resize_width == 0 || self.resize_height == 0 {
      return Err(ConfigError::Invalid("缩放尺寸不能为 0".to_string()));
    }
    if self.crop_width == 0 || self.crop_height == 0 {
      return Err(ConfigError::Invalid("裁剪尺寸不能为 0".to_string()));
    }
    if self.crop_width > self.resize_width || self.crop_height > self.resize_height {
      return Err(ConfigError::Invalid(format!(
        "裁剪尺寸 {}x{} 大于缩放尺寸 {}x{}",
        self.crop_width, self.crop_height, self.resize_width, self.resize_height
      )));
    }
    if !self.scale.is_finite() || self.scale == 0.0 {
      return Err(ConfigError::Invalid(format!("缩放系数无效: {}", self.scale)));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = CoderConfig::default();
    config.validate().unwrap();
    assert_eq!(config.min_interval(), None);
    assert_eq!(config.input_port(), "/featureCoder/img:i");
    assert_eq!(config.code_port(), "/featureCoder/code:o");
    assert_eq!(config.rpc_port(), "/featureCoder/rpc");
  }

  #[test]
  fn partial_json_keeps_defaults() {
    let config = CoderConfig::from_json_str(
      r#"{ "name": "coder", "rate": 4.0, "compute_mode": "cpu", "blob_name": "fc7" }"#,
    )
    .unwrap();
    assert_eq!(config.name, "coder");
    assert_eq!(config.compute_mode, ComputeMode::Cpu);
    assert_eq!(config.blob_name, "fc7");
    assert_eq!(config.resize_width, 256);
    assert_eq!(config.min_interval(), Some(Duration::from_millis(250)));
  }

  #[test]
  fn relative_paths_resolve_in_context_dir() {
    let config = CoderConfig {
      context_dir: Some(PathBuf::from("/data/ctx")),
      ..Default::default()
    };
    assert_eq!(config.default_dump_path(), PathBuf::from("/data/ctx/codes.bin"));
    assert_eq!(config.topology_path(), PathBuf::from("/data/ctx/feature_net.onnx"));
    assert_eq!(config.resolve("/abs/x.bin"), PathBuf::from("/abs/x.bin"));
  }

  #[test]
  fn rejects_bad_values() {
    let negative = CoderConfig {
      rate: -1.0,
      ..Default::default()
    };
    assert!(matches!(negative.validate(), Err(ConfigError::Invalid(_))));

    let crop = CoderConfig {
      crop_width: 300,
      ..Default::default()
    };
    assert!(matches!(crop.validate(), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn tiny_rate_is_rejected_without_panicking() {
    let tiny = CoderConfig {
      rate: 1e-20,
      ..Default::default()
    };
    assert!(matches!(tiny.validate(), Err(ConfigError::Invalid(_))));
    assert_eq!(tiny.min_interval(), Some(Duration::MAX));

    let slow = CoderConfig {
      rate: 0.5,
      ..Default::default()
    };
    slow.validate().unwrap();
    assert_eq!(slow.min_interval(), Some(Duration::from_secs(2)));
  }
}
