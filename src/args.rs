// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use url::Url;

use crate::config::{CoderConfig, ComputeMode, ConfigError, DEFAULT_CONFIG_FILE};

/// FeatureCoder 参数配置
///
/// 命令行参数覆盖配置文件中的同名项。
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// JSON 配置文件，相对路径基于上下文目录
  #[arg(long, value_name = "FILE")]
  pub from: Option<PathBuf>,

  /// 进程名，也是端口名前缀
  #[arg(long)]
  pub name: Option<String>,

  /// 上下文名
  #[arg(long)]
  pub context: Option<String>,

  /// 上下文目录
  #[arg(long, value_name = "DIR")]
  pub context_dir: Option<PathBuf>,

  /// 网络结构文件 (ONNX)
  #[arg(long, value_name = "FILE")]
  pub topology_file: Option<PathBuf>,

  /// 外部权重文件
  #[arg(long, value_name = "FILE")]
  pub weights_file: Option<PathBuf>,

  /// 要提取的输出层名
  #[arg(long, value_name = "NAME")]
  pub blob_name: Option<String>,

  #[arg(long, value_enum)]
  pub compute_mode: Option<ComputeMode>,

  #[arg(long)]
  pub device_id: Option<i32>,

  /// 打印每帧耗时
  #[arg(long)]
  pub timing: bool,

  #[arg(long)]
  pub resize_width: Option<u32>,

  #[arg(long)]
  pub resize_height: Option<u32>,

  #[arg(long)]
  pub crop_width: Option<u32>,

  #[arg(long)]
  pub crop_height: Option<u32>,

  /// 最大处理帧率，0 表示不限制
  #[arg(long, value_name = "FPS")]
  pub rate: Option<f64>,

  /// 启动即落盘到该文件
  #[arg(long, value_name = "FILE")]
  pub dump_code: Option<PathBuf>,

  /// 落盘时追加而不是覆盖
  #[arg(long)]
  pub append: bool,

  /// 向 img:i 输入图像的来源 (image:///path.png 或 folder:///dir)
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,

  /// 输入来源的发送帧率
  #[arg(long, default_value = "10", value_name = "FPS")]
  pub input_fps: f64,

  /// 订阅 code:o 并打印每个特征向量
  #[arg(long)]
  pub print_codes: bool,
}

impl Args {
  fn apply(&self, config: &mut CoderConfig) {
    if let Some(name) = &self.name {
      config.name = name.clone();
    }
    if let Some(context) = &self.context {
      config.context = context.clone();
    }
    if let Some(dir) = &self.context_dir {
      config.context_dir = Some(dir.clone());
    }
    if let Some(path) = &self.topology_file {
      config.topology_file = Some(path.clone());
    }
    if let Some(path) = &self.weights_file {
      config.weights_file = Some(path.clone());
    }
    if let Some(blob) = &self.blob_name {
      config.blob_name = blob.clone();
    }
    if let Some(mode) = self.compute_mode {
      config.compute_mode = mode;
    }
    if let Some(id) = self.device_id {
      config.device_id = id;
    }
    if self.timing {
      config.timing = true;
    }
    if let Some(w) = self.resize_width {
      config.resize_width = w;
    }
    if let Some(h) = self.resize_height {
      config.resize_height = h;
    }
    if let Some(w) = self.crop_width {
      config.crop_width = w;
    }
    if let Some(h) = self.crop_height {
      config.crop_height = h;
    }
    if let Some(rate) = self.rate {
      config.rate = rate;
    }
    if let Some(path) = &self.dump_code {
      config.dump_code = Some(path.clone());
    }
    if self.append {
      config.append = true;
    }
  }

  /// 依次合并：缺省值、配置文件、命令行参数
  pub fn load_config(&self) -> Result<CoderConfig, ConfigError> {
    // 先应用命令行，以便确定上下文目录
    let mut config = CoderConfig::default();
    self.apply(&mut config);

    let file = match &self.from {
      Some(path) => Some(config.resolve(path)),
      None => {
        let path = config.resolve(DEFAULT_CONFIG_FILE);
        path.is_file().then_some(path)
      }
    };

    if let Some(file) = file {
      config = CoderConfig::from_json_file(&file)?;
      self.apply(&mut config);
    } else {
      info!("未找到配置文件, 使用缺省配置");
    }

    config.validate()?;
    Ok(config)
  }
}
