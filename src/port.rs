// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/port.rs - 进程内发布/订阅网络与端口
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

//! # 端口与网络
//!
//! 进程内的发布/订阅网络。每个端口名（形如 `/name/img:i`）绑定一种消息类型，
//! 写端口把消息复制给当前所有订阅者，读端口可以挂接回调，由独立线程串行投递。
//!
//! - [`OutputPort`]：写端口，`output_count` 返回当前订阅者数量
//! - [`Subscriber`]：阻塞式读取
//! - [`InputPort`]：回调式读取，支持暂停与恢复
//! - [`RpcServer`] / [`RpcClient`]：基于同一机制的请求/应答通道
//!
//! ```
//! use feature_coder::port::{Network, OutputPort, Subscriber};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Network::local();
//! let output = OutputPort::<u32>::open(&network, "/demo/out")?;
//! let reader = Subscriber::<u32>::open(&network, "/demo/out")?;
//! assert_eq!(output.output_count(), 1);
//! output.write(&7, None)?;
//! assert_eq!(reader.recv()?.payload, 7);
//! # Ok(())
//! # }
//! ```

use std::{
  any::Any,
  collections::{HashMap, VecDeque},
  sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::{Envelope, Stamped};

#[derive(Error, Debug)]
pub enum PortError {
  #[error("网络不可用")]
  NetworkDown,
  #[error("端口名称无效: {0}")]
  InvalidName(String),
  #[error("端口 {0} 已绑定其他消息类型")]
  TypeMismatch(String),
  #[error("端口 {0} 已关闭")]
  Closed(String),
  #[error("端口 {0} 没有连接")]
  NotConnected(String),
  #[error("端口 {0} 连接已断开")]
  Disconnected(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 忽略锁中毒：持锁线程 panic 后状态仍可继续使用
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

trait Channel: Send + Sync {
  fn detach_all(&self);
  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// 回调式读端口的收件箱
///
/// 非严格模式只保留最新一条未读消息，新消息到达时覆盖旧消息；
/// 严格模式按到达顺序全部保留。中断期间到达的消息在入箱时即被丢弃。
struct Mailbox<T> {
  state: Mutex<MailboxState<T>>,
  ready: Condvar,
}

struct MailboxState<T> {
  pending: VecDeque<(Stamped<T>, Instant)>,
  strict: bool,
  interrupted: bool,
  closed: bool,
}

impl<T> Mailbox<T> {
  fn new(strict: bool) -> Self {
    Self {
      state: Mutex::new(MailboxState {
        pending: VecDeque::new(),
        strict,
        interrupted: false,
        closed: false,
      }),
      ready: Condvar::new(),
    }
  }

  /// 放入一条消息，收件箱已关闭时返回 `false`
  fn push(&self, msg: Stamped<T>, arrived: Instant) -> bool {
    let mut state = lock(&self.state);
    if state.closed {
      return false;
    }
    if state.interrupted {
      return true;
    }
    if !state.strict {
      state.pending.clear();
    }
    state.pending.push_back((msg, arrived));
    self.ready.notify_one();
    true
  }

  /// 阻塞直到有消息可取，关闭后返回 `None`
  fn take(&self) -> Option<(Stamped<T>, Instant)> {
    let mut state = lock(&self.state);
    loop {
      if state.closed {
        return None;
      }
      if let Some(next) = state.pending.pop_front() {
        return Some(next);
      }
      state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
    }
  }

  fn is_closed(&self) -> bool {
    lock(&self.state).closed
  }

  fn interrupt(&self) {
    let mut state = lock(&self.state);
    state.interrupted = true;
    state.pending.clear();
  }

  fn resume(&self) {
    lock(&self.state).interrupted = false;
  }

  fn close(&self) {
    let mut state = lock(&self.state);
    state.closed = true;
    state.pending.clear();
    self.ready.notify_all();
  }
}

enum Sink<T> {
  Queue(Sender<Stamped<T>>),
  Mailbox(Arc<Mailbox<T>>),
}

impl<T> Sink<T> {
  fn deliver(&self, msg: Stamped<T>, arrived: Instant) -> bool {
    match self {
      Sink::Queue(tx) => tx.send(msg).is_ok(),
      Sink::Mailbox(mailbox) => mailbox.push(msg, arrived),
    }
  }

  fn disconnect(&self) {
    if let Sink::Mailbox(mailbox) = self {
      mailbox.close();
    }
  }
}

struct Topic<T> {
  name: String,
  subscribers: Mutex<Vec<(u64, Sink<T>)>>,
  next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Topic<T> {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      subscribers: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(0),
    }
  }

  fn attach(&self, sink: Sink<T>) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.subscribers).push((id, sink));
    debug!("端口 {} 新增订阅者 #{}", self.name, id);
    id
  }

  fn attach_queue(&self) -> (u64, Receiver<Stamped<T>>) {
    let (tx, rx) = mpsc::channel();
    (self.attach(Sink::Queue(tx)), rx)
  }

  fn detach(&self, id: u64) {
    let mut subscribers = lock(&self.subscribers);
    if let Some(pos) = subscribers.iter().position(|(sid, _)| *sid == id) {
      let (_, sink) = subscribers.remove(pos);
      sink.disconnect();
    }
  }

  fn count(&self) -> usize {
    lock(&self.subscribers).len()
  }

  fn publish(&self, payload: &T, envelope: Option<Envelope>) -> usize {
    let arrived = Instant::now();
    let mut subscribers = lock(&self.subscribers);
    subscribers.retain(|(_, sink)| sink.deliver(Stamped::new(payload.clone(), envelope), arrived));
    subscribers.len()
  }
}

impl<T: Clone + Send + 'static> Channel for Topic<T> {
  fn detach_all(&self) {
    for (_, sink) in lock(&self.subscribers).drain(..) {
      sink.disconnect();
    }
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

struct NetworkInner {
  online: AtomicBool,
  topics: Mutex<HashMap<String, Arc<dyn Channel>>>,
}

/// 进程内消息网络，克隆后共享同一组端口
#[derive(Clone)]
pub struct Network {
  inner: Arc<NetworkInner>,
}

impl Default for Network {
  fn default() -> Self {
    Self::local()
  }
}

impl Network {
  pub fn local() -> Self {
    Self {
      inner: Arc::new(NetworkInner {
        online: AtomicBool::new(true),
        topics: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn check_network(&self) -> Result<(), PortError> {
    if self.inner.online.load(Ordering::Acquire) {
      Ok(())
    } else {
      Err(PortError::NetworkDown)
    }
  }

  /// 关闭网络：断开所有订阅者，之后无法再打开端口
  pub fn shutdown(&self) {
    self.inner.online.store(false, Ordering::Release);
    let topics = std::mem::take(&mut *lock(&self.inner.topics));
    for topic in topics.values() {
      topic.detach_all();
    }
    info!("网络已关闭, 共断开 {} 个端口", topics.len());
  }

  fn topic<T: Clone + Send + 'static>(&self, name: &str) -> Result<Arc<Topic<T>>, PortError> {
    self.check_network()?;
    if !name.starts_with('/') || name.len() < 2 || name.chars().any(char::is_whitespace) {
      return Err(PortError::InvalidName(name.to_string()));
    }

    let mut topics = lock(&self.inner.topics);
    match topics.get(name) {
      Some(existing) => Arc::clone(existing)
        .into_any()
        .downcast::<Topic<T>>()
        .map_err(|_| PortError::TypeMismatch(name.to_string())),
      None => {
        let topic = Arc::new(Topic::<T>::new(name));
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
      }
    }
  }
}

/// 写端口
pub struct OutputPort<T: Clone + Send + 'static> {
  topic: Arc<Topic<T>>,
  interrupted: AtomicBool,
  closed: AtomicBool,
}

impl<T: Clone + Send + 'static> OutputPort<T> {
  pub fn open(network: &Network, name: &str) -> Result<Self, PortError> {
    let topic = network.topic(name)?;
    info!("打开输出端口 {}", name);
    Ok(Self {
      topic,
      interrupted: AtomicBool::new(false),
      closed: AtomicBool::new(false),
    })
  }

  pub fn name(&self) -> &str {
    &self.topic.name
  }

  /// 当前连接到本端口的订阅者数量
  pub fn output_count(&self) -> usize {
    if self.closed.load(Ordering::Acquire) {
      0
    } else {
      self.topic.count()
    }
  }

  /// 写出一条消息，返回送达的订阅者数量。中断期间消息被丢弃。
  pub fn write(&self, payload: &T, envelope: Option<Envelope>) -> Result<usize, PortError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PortError::Closed(self.topic.name.clone()));
    }
    if self.interrupted.load(Ordering::Acquire) {
      debug!("端口 {} 已中断, 丢弃消息", self.topic.name);
      return Ok(0);
    }
    Ok(self.topic.publish(payload, envelope))
  }

  pub fn interrupt(&self) {
    self.interrupted.store(true, Ordering::Release);
  }

  pub fn resume(&self) {
    self.interrupted.store(false, Ordering::Release);
  }

  /// 断开所有订阅者，之后的写入返回 [`PortError::Closed`]
  pub fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      self.topic.detach_all();
      info!("关闭输出端口 {}", self.topic.name);
    }
  }
}

/// 阻塞式读端口，析构时自动断开
pub struct Subscriber<T: Clone + Send + 'static> {
  topic: Arc<Topic<T>>,
  id: u64,
  receiver: Receiver<Stamped<T>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
  pub fn open(network: &Network, name: &str) -> Result<Self, PortError> {
    let topic = network.topic(name)?;
    let (id, receiver) = topic.attach_queue();
    Ok(Self {
      topic,
      id,
      receiver,
    })
  }

  pub fn recv(&self) -> Result<Stamped<T>, PortError> {
    self
      .receiver
      .recv()
      .map_err(|_| PortError::Disconnected(self.topic.name.clone()))
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Stamped<T>>, PortError> {
    match self.receiver.recv_timeout(timeout) {
      Ok(msg) => Ok(Some(msg)),
      Err(RecvTimeoutError::Timeout) => Ok(None),
      Err(RecvTimeoutError::Disconnected) => Err(PortError::Disconnected(self.topic.name.clone())),
    }
  }

  pub fn try_recv(&self) -> Result<Option<Stamped<T>>, PortError> {
    match self.receiver.try_recv() {
      Ok(msg) => Ok(Some(msg)),
      Err(TryRecvError::Empty) => Ok(None),
      Err(TryRecvError::Disconnected) => Err(PortError::Disconnected(self.topic.name.clone())),
    }
  }
}

impl<T: Clone + Send + 'static> Drop for Subscriber<T> {
  fn drop(&mut self) {
    self.topic.detach(self.id);
  }
}

/// 回调式读端口
///
/// [`InputPort::use_callback`] 启动投递线程，把消息与其到达端口的时刻交给回调。
/// [`InputPort::open`] 只保留最新一条未读消息，回调处理期间到达的旧消息被新消息覆盖；
/// [`InputPort::open_strict`] 按到达顺序逐条投递。中断期间到达的消息被直接丢弃，不做缓存。
pub struct InputPort<T: Clone + Send + 'static> {
  topic: Arc<Topic<T>>,
  id: u64,
  mailbox: Arc<Mailbox<T>>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> InputPort<T> {
  pub fn open(network: &Network, name: &str) -> Result<Self, PortError> {
    Self::open_with(network, name, false)
  }

  /// 不丢弃任何消息的读端口，用于请求/应答
  pub fn open_strict(network: &Network, name: &str) -> Result<Self, PortError> {
    Self::open_with(network, name, true)
  }

  fn open_with(network: &Network, name: &str, strict: bool) -> Result<Self, PortError> {
    let topic = network.topic(name)?;
    let mailbox = Arc::new(Mailbox::new(strict));
    let id = topic.attach(Sink::Mailbox(mailbox.clone()));
    info!("打开输入端口 {}", name);
    Ok(Self {
      topic,
      id,
      mailbox,
      worker: Mutex::new(None),
    })
  }

  pub fn name(&self) -> &str {
    &self.topic.name
  }

  pub fn use_callback<F>(&self, mut callback: F) -> Result<(), PortError>
  where
    F: FnMut(Stamped<T>, Instant) + Send + 'static,
  {
    let mut worker = lock(&self.worker);
    if worker.is_some() || self.mailbox.is_closed() {
      return Err(PortError::Closed(self.topic.name.clone()));
    }
    let mailbox = self.mailbox.clone();
    let name = self.topic.name.clone();

    let handle = thread::Builder::new()
      .name(format!("port{}", name))
      .spawn(move || {
        while let Some((msg, arrived)) = mailbox.take() {
          callback(msg, arrived);
        }
        debug!("端口 {} 投递线程退出", name);
      })?;
    *worker = Some(handle);
    Ok(())
  }

  pub fn interrupt(&self) {
    self.mailbox.interrupt();
  }

  pub fn resume(&self) {
    self.mailbox.resume();
  }

  /// 断开订阅并等待投递线程结束
  pub fn close(&self) {
    self.topic.detach(self.id);
    self.mailbox.close();

    let handle = lock(&self.worker).take();
    if let Some(handle) = handle {
      if handle.thread().id() == thread::current().id() {
        return;
      }
      if handle.join().is_err() {
        warn!("端口 {} 投递线程异常退出", self.topic.name);
      }
      info!("关闭输入端口 {}", self.topic.name);
    }
  }
}

impl<T: Clone + Send + 'static> Drop for InputPort<T> {
  fn drop(&mut self) {
    self.close();
  }
}

/// RPC 请求：命令词与应答通道
#[derive(Clone)]
pub struct RpcRequest {
  pub words: Vec<String>,
  reply: Sender<Vec<String>>,
}

pub struct RpcServer {
  port: InputPort<RpcRequest>,
}

impl RpcServer {
  pub fn open(network: &Network, name: &str) -> Result<Self, PortError> {
    Ok(Self {
      port: InputPort::open_strict(network, name)?,
    })
  }

  pub fn name(&self) -> &str {
    self.port.name()
  }

  pub fn serve<F>(&self, mut handler: F) -> Result<(), PortError>
  where
    F: FnMut(&[String]) -> Vec<String> + Send + 'static,
  {
    self.port.use_callback(move |request, _| {
      let reply = handler(&request.payload.words);
      if request.payload.reply.send(reply).is_err() {
        debug!("RPC 客户端已断开, 丢弃应答");
      }
    })
  }

  pub fn interrupt(&self) {
    self.port.interrupt();
  }

  pub fn resume(&self) {
    self.port.resume();
  }

  pub fn close(&self) {
    self.port.close();
  }
}

pub struct RpcClient {
  port: OutputPort<RpcRequest>,
}

impl RpcClient {
  pub fn connect(network: &Network, name: &str) -> Result<Self, PortError> {
    Ok(Self {
      port: OutputPort::open(network, name)?,
    })
  }

  /// 发送命令并阻塞等待应答
  pub fn call<S: AsRef<str>>(&self, words: &[S]) -> Result<Vec<String>, PortError> {
    if self.port.output_count() == 0 {
      return Err(PortError::NotConnected(self.port.name().to_string()));
    }

    let (tx, rx) = mpsc::channel();
    let request = RpcRequest {
      words: words.iter().map(|w| w.as_ref().to_string()).collect(),
      reply: tx,
    };
    self.port.write(&request, None)?;
    drop(request);

    rx.recv()
      .map_err(|_| PortError::Disconnected(self.port.name().to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn output_count_follows_subscribers() {
    let network = Network::local();
    let output = OutputPort::<u8>::open(&network, "/t/out").unwrap();
    assert_eq!(output.output_count(), 0);

    let a = Subscriber::<u8>::open(&network, "/t/out").unwrap();
    let b = Subscriber::<u8>::open(&network, "/t/out").unwrap();
    assert_eq!(output.output_count(), 2);

    drop(a);
    assert_eq!(output.output_count(), 1);
    assert_eq!(output.write(&5, None).unwrap(), 1);
    assert_eq!(b.recv().unwrap().payload, 5);
  }

  #[test]
  fn envelope_travels_with_message() {
    let network = Network::local();
    let output = OutputPort::<u8>::open(&network, "/t/stamp").unwrap();
    let reader = Subscriber::<u8>::open(&network, "/t/stamp").unwrap();
    let envelope = Envelope::new(42);

    output.write(&1, Some(envelope)).unwrap();
    assert_eq!(reader.recv().unwrap().envelope, Some(envelope));
  }

  #[test]
  fn interrupted_output_drops_writes() {
    let network = Network::local();
    let output = OutputPort::<u8>::open(&network, "/t/int").unwrap();
    let reader = Subscriber::<u8>::open(&network, "/t/int").unwrap();

    output.interrupt();
    assert_eq!(output.write(&1, None).unwrap(), 0);
    output.resume();
    output.write(&2, None).unwrap();
    assert_eq!(reader.try_recv().unwrap().map(|m| m.payload), Some(2));
  }

  #[test]
  fn closed_output_disconnects_readers() {
    let network = Network::local();
    let output = OutputPort::<u8>::open(&network, "/t/close").unwrap();
    let reader = Subscriber::<u8>::open(&network, "/t/close").unwrap();

    output.close();
    assert!(matches!(output.write(&1, None), Err(PortError::Closed(_))));
    assert!(matches!(reader.recv(), Err(PortError::Disconnected(_))));
  }

  #[test]
  fn rejects_bad_names_and_types() {
    let network = Network::local();
    assert!(matches!(
      OutputPort::<u8>::open(&network, "no-slash"),
      Err(PortError::InvalidName(_))
    ));
    OutputPort::<u8>::open(&network, "/t/typed").unwrap();
    assert!(matches!(
      Subscriber::<String>::open(&network, "/t/typed"),
      Err(PortError::TypeMismatch(_))
    ));
  }

  #[test]
  fn shutdown_network_refuses_ports() {
    let network = Network::local();
    assert!(network.check_network().is_ok());
    network.shutdown();
    assert!(matches!(network.check_network(), Err(PortError::NetworkDown)));
    assert!(matches!(
      OutputPort::<u8>::open(&network, "/t/late"),
      Err(PortError::NetworkDown)
    ));
  }

  /// 第一条消息在回调中阻塞，直到 `release` 收到信号
  fn blocking_on_first(input: &InputPort<u32>) -> (mpsc::Receiver<u32>, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    input
      .use_callback(move |msg, _| {
        tx.send(msg.payload).unwrap();
        if msg.payload == 1 {
          release_rx.recv().unwrap();
        }
      })
      .unwrap();
    (rx, release_tx)
  }

  #[test]
  fn strict_input_port_delivers_in_order() {
    let network = Network::local();
    let output = OutputPort::<u32>::open(&network, "/t/strict").unwrap();
    let input = InputPort::<u32>::open_strict(&network, "/t/strict").unwrap();
    let (rx, release) = blocking_on_first(&input);

    output.write(&1, None).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    output.write(&2, None).unwrap();
    output.write(&3, None).unwrap();
    release.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);

    input.close();
    assert_eq!(output.output_count(), 0);
  }

  #[test]
  fn busy_input_port_keeps_only_latest() {
    let network = Network::local();
    let output = OutputPort::<u32>::open(&network, "/t/latest").unwrap();
    let input = InputPort::<u32>::open(&network, "/t/latest").unwrap();
    let (rx, release) = blocking_on_first(&input);

    output.write(&1, None).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    for v in 2..=5 {
      output.write(&v, None).unwrap();
    }
    release.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 5);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  }

  #[test]
  fn interrupted_input_port_drops_arrivals() {
    let network = Network::local();
    let output = OutputPort::<u32>::open(&network, "/t/pause").unwrap();
    let input = InputPort::<u32>::open_strict(&network, "/t/pause").unwrap();
    let (rx, release) = blocking_on_first(&input);

    output.write(&1, None).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    input.interrupt();
    output.write(&2, None).unwrap();
    input.resume();
    output.write(&3, None).unwrap();
    release.send(()).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  }

  #[test]
  fn arrival_time_is_stamped_on_write() {
    let network = Network::local();
    let output = OutputPort::<u32>::open(&network, "/t/arrive").unwrap();
    let input = InputPort::<u32>::open(&network, "/t/arrive").unwrap();
    let (tx, rx) = mpsc::channel();
    input.use_callback(move |_, arrived| tx.send(arrived).unwrap()).unwrap();

    let before = Instant::now();
    output.write(&1, None).unwrap();
    let after = Instant::now();
    let arrived = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(before <= arrived && arrived <= after);
  }

  #[test]
  fn closed_input_port_refuses_callback() {
    let network = Network::local();
    let input = InputPort::<u32>::open(&network, "/t/shut").unwrap();
    input.close();
    assert!(matches!(
      input.use_callback(|_, _| {}),
      Err(PortError::Closed(_))
    ));
  }

  #[test]
  fn rpc_round_trip() {
    let network = Network::local();
    let server = RpcServer::open(&network, "/t/rpc").unwrap();
    server
      .serve(|words| words.iter().rev().cloned().collect())
      .unwrap();

    let client = RpcClient::connect(&network, "/t/rpc").unwrap();
    assert_eq!(client.call(&["a", "b"]).unwrap(), vec!["b", "a"]);

    server.close();
    assert!(matches!(client.call(&["a"]), Err(PortError::NotConnected(_))));
  }
}
