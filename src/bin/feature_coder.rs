// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/bin/feature_coder.rs - 特征编码服务
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

use std::{io::BufRead, thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use url::Url;

use feature_coder::{
  FromUrl,
  args::Args,
  extractor::{FeatureVector, OnnxExtractorBuilder},
  frame::{Envelope, RgbFrame},
  input::InputWrapper,
  module::CoderModule,
  port::{Network, OutputPort, RpcClient, Subscriber},
};

/// 从输入来源读取图像并按固定帧率写入 img:i
fn spawn_source(network: &Network, port: &str, url: &Url, fps: f64) -> Result<()> {
  let input = InputWrapper::from_url(url)?;
  let output = OutputPort::<RgbFrame>::open(network, port)?;
  let period = if fps.is_finite() && fps > 0.0 {
    Duration::from_secs_f64(1.0 / fps)
  } else {
    Duration::ZERO
  };

  info!("输入来源: {}, 帧间隔 {:?}", url, period);
  thread::Builder::new()
    .name("source".to_string())
    .spawn(move || {
      for (count, frame) in input.enumerate() {
        if let Err(err) = output.write(&frame, Some(Envelope::new(count as u64))) {
          warn!("输入来源写入失败: {}", err);
          break;
        }
        thread::sleep(period);
      }
      info!("输入来源已结束");
    })?;
  Ok(())
}

fn spawn_printer(network: &Network, port: &str) -> Result<()> {
  let codes = Subscriber::<FeatureVector>::open(network, port)?;
  thread::Builder::new()
    .name("printer".to_string())
    .spawn(move || {
      while let Ok(msg) = codes.recv() {
        let head: Vec<String> = msg
          .payload
          .values()
          .iter()
          .take(4)
          .map(|v| format!("{:.4}", v))
          .collect();
        match msg.envelope {
          Some(envelope) => info!(
            "#{} @ {}: {} 维 [{}, ...]",
            envelope.count,
            envelope.time,
            msg.payload.len(),
            head.join(", ")
          ),
          None => info!("{} 维 [{}, ...]", msg.payload.len(), head.join(", ")),
        }
      }
    })?;
  Ok(())
}

/// 把标准输入的每一行作为命令发送到 rpc 端口
fn spawn_terminal(network: &Network, port: &str) -> Result<()> {
  let client = RpcClient::connect(network, port)?;
  thread::Builder::new()
    .name("terminal".to_string())
    .spawn(move || {
      for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
          break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
          continue;
        }
        match client.call(&words) {
          Ok(reply) => {
            for item in reply {
              println!("{}", item);
            }
          }
          Err(err) => warn!("命令发送失败: {}", err),
        }
      }
    })?;
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let network = Network::local();
  if let Err(err) = network.check_network() {
    error!("消息网络不可用: {}", err);
    std::process::exit(1);
  }

  let config = args.load_config()?;
  info!("进程名: {}", config.name);
  info!("上下文目录: {}", config.context_path().display());
  info!("提取层: {}", config.blob_name);
  info!("最大帧率: {}", config.rate);

  info!("正在加载模型...");
  let extractor = OnnxExtractorBuilder::from_config(&config).build()?;
  info!("模型加载完成");

  let module = CoderModule::configure(&network, &config, extractor)?;

  if let Some(url) = &args.input {
    spawn_source(&network, &config.input_port(), url, args.input_fps)?;
  }
  if args.print_codes {
    spawn_printer(&network, &config.code_port())?;
  }
  spawn_terminal(&network, &config.rpc_port())?;

  module.run_module()?;

  info!("处理完成!");
  Ok(())
}
