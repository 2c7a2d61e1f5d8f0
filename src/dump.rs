// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/dump.rs - 特征向量落盘
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

//! 落盘文件是若干定长向量的直接拼接：没有文件头、分隔符或计数，
//! 每个分量为小端 `f64`。读取方需要事先知道向量维数。

use std::{
  fs::{File, OpenOptions},
  io::{self, Write},
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::extractor::FeatureVector;

#[derive(Error, Debug)]
pub enum DumpReadError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("向量维数不能为 0")]
  ZeroDimension,
  #[error("文件长度 {len} 不是单个向量长度 {stride} 的整数倍")]
  Truncated { len: usize, stride: usize },
}

/// 按给定维数读回落盘文件中的全部向量
pub fn read_codes<P: AsRef<Path>>(path: P, dim: usize) -> Result<Vec<FeatureVector>, DumpReadError> {
  if dim == 0 {
    return Err(DumpReadError::ZeroDimension);
  }
  let bytes = std::fs::read(path)?;
  let stride = dim * size_of::<f64>();
  if bytes.len() % stride != 0 {
    return Err(DumpReadError::Truncated {
      len: bytes.len(),
      stride,
    });
  }
  Ok(
    bytes
      .chunks_exact(stride)
      .filter_map(FeatureVector::from_bytes)
      .collect(),
  )
}

struct ActiveDump {
  path: PathBuf,
  file: File,
}

/// 落盘状态：未激活，或持有一个打开的文件
#[derive(Default)]
pub struct CodeDump {
  active: Option<ActiveDump>,
}

impl CodeDump {
  pub fn new() -> Self {
    Self::default()
  }

  /// 打开（或重新打开）落盘文件。已有的文件先关闭。
  pub fn begin<P: AsRef<Path>>(&mut self, path: P, append: bool) -> io::Result<()> {
    let path = path.as_ref();
    self.end();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    if append {
      options.append(true).create(true);
    } else {
      options.write(true).create(true).truncate(true);
    }
    let file = options.open(path)?;

    info!(
      "开始落盘特征向量: {} ({})",
      path.display(),
      if append { "追加" } else { "覆盖" }
    );
    self.active = Some(ActiveDump {
      path: path.to_path_buf(),
      file,
    });
    Ok(())
  }

  /// 关闭落盘文件，返回之前是否处于激活状态
  pub fn end(&mut self) -> bool {
    match self.active.take() {
      Some(active) => {
        info!("停止落盘: {}", active.path.display());
        true
      }
      None => false,
    }
  }

  pub fn is_active(&self) -> bool {
    self.active.is_some()
  }

  pub fn path(&self) -> Option<&Path> {
    self.active.as_ref().map(|a| a.path.as_path())
  }

  /// 激活时写入整个向量并返回写入的字节数，未激活时什么也不做
  pub fn write_if_active(&mut self, code: &FeatureVector) -> io::Result<usize> {
    match self.active.as_mut() {
      Some(active) => {
        let bytes = code.to_bytes();
        active.file.write_all(&bytes)?;
        debug!("写入 {} 字节到 {}", bytes.len(), active.path.display());
        Ok(bytes.len())
      }
      None => Ok(0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn code() -> FeatureVector {
    FeatureVector::new(vec![1.0, 2.0, 3.0])
  }

  #[test]
  fn inactive_dump_writes_nothing() {
    let mut dump = CodeDump::new();
    assert!(!dump.is_active());
    assert_eq!(dump.write_if_active(&code()).unwrap(), 0);
    assert!(!dump.end());
  }

  #[test]
  fn truncate_then_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("codes.bin");
    let mut dump = CodeDump::new();

    dump.begin(&path, false).unwrap();
    assert_eq!(dump.write_if_active(&code()).unwrap(), 24);
    dump.write_if_active(&code()).unwrap();
    assert!(dump.end());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);

    dump.begin(&path, true).unwrap();
    dump.write_if_active(&code()).unwrap();
    dump.end();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 72);

    dump.begin(&path, false).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(dump.path(), Some(path.as_path()));
  }

  #[test]
  fn reads_back_written_codes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("codes.bin");
    let mut dump = CodeDump::new();
    dump.begin(&path, false).unwrap();
    dump.write_if_active(&code()).unwrap();
    dump.write_if_active(&FeatureVector::new(vec![4.0, 5.0, 6.0])).unwrap();
    dump.end();

    let codes = read_codes(&path, 3).unwrap();
    assert_eq!(codes, vec![code(), FeatureVector::new(vec![4.0, 5.0, 6.0])]);
    assert!(matches!(
      read_codes(&path, 4),
      Err(DumpReadError::Truncated { len: 48, stride: 32 })
    ));
    assert!(matches!(read_codes(&path, 0), Err(DumpReadError::ZeroDimension)));
  }

  #[test]
  fn restart_switches_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.bin");
    let second = dir.path().join("nested/b.bin");
    let mut dump = CodeDump::new();

    dump.begin(&first, false).unwrap();
    dump.begin(&second, false).unwrap();
    dump.write_if_active(&code()).unwrap();

    assert_eq!(std::fs::metadata(&first).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(&second).unwrap().len(), 24);
  }
}
