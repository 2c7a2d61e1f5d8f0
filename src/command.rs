// 该文件是 FeatureCoder （特征编码器） 项目的一部分。
// src/command.rs - 控制通道命令
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

use std::{fmt, path::PathBuf};

use tracing::warn;

const APPEND_FLAG: &str = "a";

/// 控制命令，在通道边界解析一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  Help,
  StartDump { path: Option<PathBuf>, append: bool },
  Stop,
  Unrecognized(Vec<String>),
}

impl Command {
  pub fn parse<S: AsRef<str>>(words: &[S]) -> Self {
    let words: Vec<&str> = words.iter().map(|w| w.as_ref()).collect();
    match words.as_slice() {
      ["help"] => Command::Help,
      ["help", ..] => {
        warn!("help 不接受参数, 忽略 {} 个参数", words.len() - 1);
        Command::Help
      }
      ["stop"] => Command::Stop,
      ["stop", ..] => {
        warn!("stop 不接受参数, 忽略 {} 个参数", words.len() - 1);
        Command::Stop
      }
      ["dump"] => Command::StartDump {
        path: None,
        append: false,
      },
      ["dump", flag] if *flag == APPEND_FLAG => Command::StartDump {
        path: None,
        append: true,
      },
      ["dump", path] => Command::StartDump {
        path: Some(PathBuf::from(path)),
        append: false,
      },
      ["dump", path, flag] => Command::StartDump {
        path: Some(PathBuf::from(path)),
        append: *flag == APPEND_FLAG,
      },
      ["dump", ..] => {
        warn!("dump 参数过多 ({}), 按无参数处理", words.len() - 1);
        Command::StartDump {
          path: None,
          append: false,
        }
      }
      _ => Command::Unrecognized(words.iter().map(|w| w.to_string()).collect()),
    }
  }

  pub fn from_line(line: &str) -> Self {
    let words: Vec<&str> = line.split_whitespace().collect();
    Self::parse(&words)
  }
}

/// 人类可读的应答，每项一个字符串
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply(Vec<String>);

impl Reply {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn line<S: Into<String>>(text: S) -> Self {
    Self(vec![text.into()])
  }

  pub fn add<S: Into<String>>(&mut self, text: S) -> &mut Self {
    self.0.push(text.into());
    self
  }

  pub fn lines(&self) -> &[String] {
    &self.0
  }

  pub fn into_lines(self) -> Vec<String> {
    self.0
  }
}

impl fmt::Display for Reply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, line) in self.0.iter().enumerate() {
      if i > 0 {
        writeln!(f)?;
      }
      write!(f, "{}", line)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dump(path: Option<&str>, append: bool) -> Command {
    Command::StartDump {
      path: path.map(PathBuf::from),
      append,
    }
  }

  #[test]
  fn parses_documented_shapes() {
    assert_eq!(Command::from_line("help"), Command::Help);
    assert_eq!(Command::from_line("stop"), Command::Stop);
    assert_eq!(Command::from_line("dump"), dump(None, false));
    assert_eq!(Command::from_line("dump a"), dump(None, true));
    assert_eq!(Command::from_line("dump out.bin"), dump(Some("out.bin"), false));
    assert_eq!(Command::from_line("dump out.bin a"), dump(Some("out.bin"), true));
    assert_eq!(Command::from_line("dump out.bin x"), dump(Some("out.bin"), false));
  }

  #[test]
  fn unexpected_arguments_fall_back_to_default() {
    assert_eq!(Command::from_line("dump a b c"), dump(None, false));
    assert_eq!(Command::from_line("stop now"), Command::Stop);
    assert_eq!(Command::from_line("help me please"), Command::Help);
  }

  #[test]
  fn unknown_words_are_kept() {
    assert_eq!(
      Command::from_line("  quit now "),
      Command::Unrecognized(vec!["quit".to_string(), "now".to_string()])
    );
    assert_eq!(Command::from_line(""), Command::Unrecognized(vec![]));
    assert_eq!(
      Command::from_line("HELP"),
      Command::Unrecognized(vec!["HELP".to_string()])
    );
  }

  #[test]
  fn reply_displays_one_line_per_item() {
    let mut reply = Reply::line("a");
    reply.add("b");
    assert_eq!(reply.to_string(), "a\nb");
  }
}
