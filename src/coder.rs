// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/coder.rs - 图像帧到特征向量的转发器
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

//! # 特征编码转发器
//!
//! [`FeatureCoder`] 订阅 `/<name>/img:i`，对每一帧：
//!
//! 1. 跳过宽或高为 0 的帧，以及距上一帧处理时间不足 `1/rate` 秒的帧（不加锁）
//! 2. 加锁，RGB 转 BGR 后同步调用特征提取器，失败则丢弃该帧
//! 3. 落盘激活时追加向量的原始字节
//! 4. `/<name>/code:o` 有订阅者时发布向量，信封沿用输入帧的信封
//! 5. `/<name>/img:o` 有订阅者时原样转发输入帧
//!
//! 控制命令与帧处理共用同一把锁。

use std::{
  io,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  command::{Command, Reply},
  config::CoderConfig,
  dump::CodeDump,
  extractor::{FeatureExtractor, FeatureVector},
  frame::{RgbFrame, Stamped},
  port::{InputPort, Network, OutputPort, PortError, lock},
};

pub const HELP_DUMP: &str =
  "[dump] [path-to-file] [a] to start dumping the codes in the context directory. Use 'a' for appending.";
pub const HELP_STOP: &str = "[stop] to stop dumping.";
pub const REPLY_DUMP_STARTED: &str = "Start dumping codes...";
pub const REPLY_DUMP_STOPPED: &str = "Stopped code dump.";

#[derive(Error, Debug)]
pub enum CoderError {
  #[error("端口错误: {0}")]
  PortError(#[from] PortError),
  #[error("落盘文件错误: {0}")]
  DumpError(#[from] io::Error),
}

/// 单帧处理结果，只用于日志与测试，不会回传给帧的生产者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
  Empty,
  Throttled,
  Closed,
  Failed,
  Processed {
    bytes_dumped: usize,
    code_published: bool,
    image_published: bool,
  },
}

struct CoderState<E> {
  extractor: Option<E>,
  dump: CodeDump,
  code_port: OutputPort<FeatureVector>,
  image_port: OutputPort<RgbFrame>,
  closed: bool,
}

pub struct FeatureCoder<E: FeatureExtractor> {
  name: String,
  context: PathBuf,
  default_dump: PathBuf,
  timing: bool,
  min_interval: Option<Duration>,
  epoch: Instant,
  // 上一次成功处理的帧的到达时刻（相对 epoch 的纳秒数加 1），0 表示尚未处理过
  last_read: AtomicU64,
  processed: AtomicU64,
  input: InputPort<RgbFrame>,
  state: Mutex<CoderState<E>>,
}

impl<E: FeatureExtractor + 'static> FeatureCoder<E> {
  /// 打开输出端口、订阅输入端口并挂接回调
  pub fn open(network: &Network, config: &CoderConfig, extractor: E) -> Result<Arc<Self>, CoderError> {
    let image_port = OutputPort::open(network, &config.image_port())?;
    let code_port = OutputPort::open(network, &config.code_port())?;

    let mut dump = CodeDump::new();
    if let Some(path) = &config.dump_code {
      dump.begin(config.resolve(path), config.append)?;
    }

    let input = InputPort::open(network, &config.input_port())?;
    let coder = Arc::new(Self {
      name: config.name.clone(),
      context: config.context_path(),
      default_dump: config.default_dump_path(),
      timing: config.timing,
      min_interval: config.min_interval(),
      epoch: Instant::now(),
      last_read: AtomicU64::new(0),
      processed: AtomicU64::new(0),
      input,
      state: Mutex::new(CoderState {
        extractor: Some(extractor),
        dump,
        code_port,
        image_port,
        closed: false,
      }),
    });

    let weak = Arc::downgrade(&coder);
    coder.input.use_callback(move |frame, arrived| {
      if let Some(coder) = weak.upgrade() {
        coder.on_frame_at(&frame, arrived);
      }
    })?;

    info!(
      "{} 已启动, 上下文目录: {}, 最小帧间隔: {:?}",
      coder.name,
      coder.context.display(),
      coder.min_interval
    );
    Ok(coder)
  }
}

impl<E: FeatureExtractor> FeatureCoder<E> {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn context_path(&self) -> &Path {
    &self.context
  }

  pub fn frames_processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }

  pub fn is_dumping(&self) -> bool {
    lock(&self.state).dump.is_active()
  }

  pub fn dump_path(&self) -> Option<PathBuf> {
    lock(&self.state).dump.path().map(Path::to_path_buf)
  }

  pub fn on_frame(&self, frame: &Stamped<RgbFrame>) -> FrameOutcome {
    self.on_frame_at(frame, Instant::now())
  }

  fn ticks(&self, at: Instant) -> u64 {
    at.saturating_duration_since(self.epoch).as_nanos() as u64 + 1
  }

  /// 以帧到达的时刻判断是否已过最小间隔
  fn pass_rate_gate(&self, arrived: Instant) -> bool {
    let Some(interval) = self.min_interval else {
      return true;
    };
    let last = self.last_read.load(Ordering::Acquire);
    last == 0 || u128::from(self.ticks(arrived).saturating_sub(last)) >= interval.as_nanos()
  }

  /// 处理一帧，`arrived` 为该帧到达输入端口的时刻
  fn on_frame_at(&self, frame: &Stamped<RgbFrame>, arrived: Instant) -> FrameOutcome {
    if frame.payload.is_empty() {
      debug!("收到空帧, 跳过");
      return FrameOutcome::Empty;
    }
    if !self.pass_rate_gate(arrived) {
      debug!("距上一帧不足 {:?}, 丢弃", self.min_interval);
      return FrameOutcome::Throttled;
    }

    let mut state = lock(&self.state);
    let state = &mut *state;
    if state.closed {
      return FrameOutcome::Closed;
    }
    let Some(extractor) = state.extractor.as_mut() else {
      return FrameOutcome::Closed;
    };

    let bgr = frame.payload.to_bgr();
    let extraction = match extractor.extract(&bgr) {
      Ok(extraction) => extraction,
      Err(err) => {
        warn!("特征提取失败: {}, 丢弃该帧", err);
        return FrameOutcome::Failed;
      }
    };
    if self.timing {
      info!(
        "{:.2?}: PREP {:.2?}: NET",
        extraction.timings.prep, extraction.timings.net
      );
    }
    // 只有成功提取的帧占用限速窗口
    self.last_read.store(self.ticks(arrived), Ordering::Release);
    let code = FeatureVector::from_f32(&extraction.code);

    let bytes_dumped = match state.dump.write_if_active(&code) {
      Ok(n) => n,
      Err(err) => {
        error!("写入落盘文件失败: {}, 停止落盘", err);
        state.dump.end();
        0
      }
    };

    let code_published = state.code_port.output_count() > 0
      && match state.code_port.write(&code, frame.envelope) {
        Ok(n) => n > 0,
        Err(err) => {
          warn!("发布特征向量失败: {}", err);
          false
        }
      };

    let image_published = state.image_port.output_count() > 0
      && match state.image_port.write(&frame.payload, frame.envelope) {
        Ok(n) => n > 0,
        Err(err) => {
          warn!("转发图像失败: {}", err);
          false
        }
      };

    let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(
      "第 {} 帧: {} 维, 落盘 {} 字节",
      count,
      code.len(),
      bytes_dumped
    );

    FrameOutcome::Processed {
      bytes_dumped,
      code_published,
      image_published,
    }
  }

  fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.context.join(path)
    }
  }

  /// 处理本转发器认识的命令，其余命令返回 `None` 交给调用方
  pub fn execute_request(&self, command: &Command) -> Option<Reply> {
    match command {
      Command::Help => {
        let mut reply = Reply::new();
        reply.add(HELP_DUMP).add(HELP_STOP);
        Some(reply)
      }
      Command::StartDump { path, append } => {
        let path = match path {
          Some(path) => self.resolve(path),
          None => self.default_dump.clone(),
        };
        let mut state = lock(&self.state);
        if state.closed {
          return Some(Reply::line(format!("{} is closed.", self.name)));
        }
        match state.dump.begin(&path, *append) {
          Ok(()) => Some(Reply::line(REPLY_DUMP_STARTED)),
          Err(err) => {
            error!("无法打开落盘文件 {}: {}", path.display(), err);
            Some(Reply::line(format!(
              "Failed to open {}: {}",
              path.display(),
              err
            )))
          }
        }
      }
      Command::Stop => {
        lock(&self.state).dump.end();
        Some(Reply::line(REPLY_DUMP_STOPPED))
      }
      Command::Unrecognized(_) => None,
    }
  }

  /// 暂停输入与输出端口，状态保持不变
  pub fn interrupt(&self) {
    let state = lock(&self.state);
    state.code_port.interrupt();
    state.image_port.interrupt();
    self.input.interrupt();
    info!("{} 已暂停", self.name);
  }

  pub fn resume(&self) {
    let state = lock(&self.state);
    state.code_port.resume();
    state.image_port.resume();
    self.input.resume();
    info!("{} 已恢复", self.name);
  }

  /// 关闭落盘文件与全部端口并释放特征提取器，可重复调用
  pub fn close(&self) {
    {
      let mut state = lock(&self.state);
      if state.closed {
        return;
      }
      state.closed = true;
      state.dump.end();
      state.code_port.close();
      state.image_port.close();
      state.extractor.take();
    }
    // 投递线程可能正在等锁，必须在释放锁之后再等待它退出
    self.input.close();
    info!(
      "{} 已关闭, 共处理 {} 帧",
      self.name,
      self.frames_processed()
    );
  }
}

impl<E: FeatureExtractor> Drop for FeatureCoder<E> {
  fn drop(&mut self) {
    self.close();
  }
}
