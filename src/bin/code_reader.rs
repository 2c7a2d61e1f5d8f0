// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/bin/code_reader.rs - 落盘文件读取工具
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use feature_coder::dump::read_codes;

/// 读取特征向量落盘文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 落盘文件路径
  #[arg(long, value_name = "FILE")]
  pub file: PathBuf,

  /// 向量维数
  #[arg(long, value_name = "DIM")]
  pub dim: usize,

  /// 每行输出一个 JSON 数组
  #[arg(long)]
  pub json: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let codes = read_codes(&args.file, args.dim)
    .with_context(|| format!("无法读取 {}", args.file.display()))?;
  info!("{}: {} 个 {} 维向量", args.file.display(), codes.len(), args.dim);

  if args.json {
    for code in &codes {
      println!("{}", serde_json::to_string(code.values())?);
    }
  } else {
    println!("{}", codes.len());
  }

  Ok(())
}
