// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/module.rs - 进程生命周期与控制通道
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  coder::{CoderError, FeatureCoder},
  command::{Command, Reply},
  config::CoderConfig,
  extractor::FeatureExtractor,
  port::{Network, PortError, RpcServer},
};

const MODULE_PERIOD: Duration = Duration::from_secs(1);
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ModuleError {
  #[error("转发器错误: {0}")]
  CoderError(#[from] CoderError),
  #[error("端口错误: {0}")]
  PortError(#[from] PortError),
  #[error("无法设置中断信号处理: {0}")]
  SignalError(#[from] ctrlc::Error),
}

/// 未被转发器处理的命令的缺省应答
fn default_respond(stop: &AtomicBool, command: &Command) -> Reply {
  match command {
    Command::Unrecognized(words) if matches!(words.as_slice(), [w, ..] if w == "quit" || w == "exit") => {
      info!("收到退出命令");
      stop.store(true, Ordering::Release);
      Reply::line("bye")
    }
    Command::Unrecognized(words) => {
      debug!("无法识别的命令: {:?}", words);
      Reply::line(format!("Command not understood -- {}", words.join(" ")))
    }
    // 转发器处理全部已知命令，这里只为穷尽匹配
    _ => Reply::line("Command not understood"),
  }
}

fn respond<E: FeatureExtractor>(coder: &FeatureCoder<E>, stop: &AtomicBool, command: &Command) -> Reply {
  coder
    .execute_request(command)
    .unwrap_or_else(|| default_respond(stop, command))
}

/// 转发器外层的进程模块：持有转发器与 `/<name>/rpc` 控制端口
pub struct CoderModule<E: FeatureExtractor> {
  coder: Arc<FeatureCoder<E>>,
  rpc: RpcServer,
  stop: Arc<AtomicBool>,
  period: Duration,
}

impl<E: FeatureExtractor + 'static> CoderModule<E> {
  pub fn configure(network: &Network, config: &CoderConfig, extractor: E) -> Result<Self, ModuleError> {
    let coder = FeatureCoder::open(network, config, extractor)?;
    let rpc = RpcServer::open(network, &config.rpc_port())?;
    let stop = Arc::new(AtomicBool::new(false));

    {
      let coder = coder.clone();
      let stop = stop.clone();
      rpc.serve(move |words| {
        let command = Command::parse(words);
        respond(&coder, &stop, &command).into_lines()
      })?;
    }
    info!("控制端口 {} 已就绪", rpc.name());

    Ok(Self {
      coder,
      rpc,
      stop,
      period: MODULE_PERIOD,
    })
  }

  pub fn with_period(mut self, period: Duration) -> Self {
    self.period = period;
    self
  }

  pub fn coder(&self) -> &Arc<FeatureCoder<E>> {
    &self.coder
  }

  pub fn stop_handle(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  pub fn respond(&self, command: &Command) -> Reply {
    respond(&self.coder, &self.stop, command)
  }

  fn update(&self) {
    debug!("已处理 {} 帧", self.coder.frames_processed());
  }

  pub fn interrupt_module(&self) {
    self.coder.interrupt();
    self.rpc.interrupt();
  }

  pub fn close(&self) {
    self.coder.close();
    self.rpc.close();
  }

  /// 周期性运行直到收到停止请求，然后中断并关闭全部端口
  pub fn run(self) -> Result<(), ModuleError> {
    info!("{} 开始运行", self.coder.name());
    while !self.stop.load(Ordering::Acquire) {
      thread::sleep(self.period);
      self.update();
    }

    info!("{} 正在退出", self.coder.name());
    self.interrupt_module();
    self.close();
    Ok(())
  }

  /// 安装中断信号处理后运行。首次信号请求停止，30 秒内未退出则强制结束进程。
  pub fn run_module(self) -> Result<(), ModuleError> {
    let stop = self.stop.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::Release);
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    self.run()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    coder::{HELP_DUMP, HELP_STOP},
    extractor::{Extraction, ExtractionError, Timings},
    frame::BgrFrame,
    port::RpcClient,
  };

  struct ZeroExtractor;

  impl FeatureExtractor for ZeroExtractor {
    fn extract(&mut self, _frame: &BgrFrame) -> Result<Extraction, ExtractionError> {
      Ok(Extraction {
        code: vec![0.0],
        timings: Timings::default(),
      })
    }
  }

  fn module(network: &Network, dir: &tempfile::TempDir) -> CoderModule<ZeroExtractor> {
    let config = CoderConfig {
      name: "mod".to_string(),
      context_dir: Some(dir.path().to_path_buf()),
      ..Default::default()
    };
    CoderModule::configure(network, &config, ZeroExtractor).unwrap()
  }

  #[test]
  fn falls_back_to_default_handler() {
    let dir = tempfile::tempdir().unwrap();
    let module = module(&Network::local(), &dir);

    let reply = module.respond(&Command::from_line("jump high"));
    assert_eq!(reply.lines(), &["Command not understood -- jump high"]);
    assert!(!module.stop_handle().load(Ordering::Acquire));

    assert_eq!(module.respond(&Command::from_line("exit now")).lines(), &["bye"]);
    assert!(module.stop_handle().load(Ordering::Acquire));
  }

  #[test]
  fn rpc_port_reaches_coder() {
    let dir = tempfile::tempdir().unwrap();
    let network = Network::local();
    let module = module(&network, &dir);
    let client = RpcClient::connect(&network, "/mod/rpc").unwrap();

    assert_eq!(client.call(&["help"]).unwrap(), vec![HELP_DUMP, HELP_STOP]);
    client.call(&["dump"]).unwrap();
    assert!(module.coder().is_dumping());
    client.call(&["stop"]).unwrap();
    assert!(!module.coder().is_dumping());
  }

  #[test]
  fn quit_over_rpc_ends_run() {
    let dir = tempfile::tempdir().unwrap();
    let network = Network::local();
    let module = module(&network, &dir).with_period(Duration::from_millis(10));
    let client = RpcClient::connect(&network, "/mod/rpc").unwrap();
    let coder = module.coder().clone();

    let runner = thread::spawn(move || module.run());
    assert_eq!(client.call(&["quit"]).unwrap(), vec!["bye"]);
    runner.join().unwrap().unwrap();

    assert!(matches!(client.call(&["help"]), Err(PortError::NotConnected(_))));
    assert!(!coder.is_dumping());
  }
}
