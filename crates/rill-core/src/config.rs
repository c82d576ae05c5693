//! 进程启动期读取的运行时配置。
//!
//! ## 设计目标（Why）
//! - 缓冲容量与定时器清扫策略属于进程级参数，启动时定格一次即可；
//!   运行期读取全部走内存快照，不触碰环境变量。
//!
//! ## 契约说明（What）
//! - 配置键采用稳定的 kebab-case 命名，经 [`ConfigKey::env_var`] 映射为
//!   `RILL_` 前缀的环境变量（`buffer-size` → `RILL_BUFFER_SIZE`）；
//! - 解析失败回退默认值并向全局钩子上报一次，进程不因配置损坏而拒绝启动；
//! - 默认值：`buffer-size = 128`，`purge-enabled = true`，
//!   `purge-period-seconds = 1`。
//!
//! ## 风险提示（Trade-offs）
//! - 快照在首次访问时定格；其后修改环境变量不会生效，这是刻意选择。

use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::RillError;
use crate::hook;

/// 配置项的稳定标识符，遵循 `<域>.<名称>` 的登记约定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    domain: &'static str,
    name: &'static str,
}

impl ConfigKey {
    pub const fn new(domain: &'static str, name: &'static str) -> Self {
        Self { domain, name }
    }

    /// kebab-case 键名，面向文档与诊断输出。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 映射出的环境变量名：`RILL_` 前缀 + 大写 + 下划线。
    pub fn env_var(&self) -> String {
        let mut var = String::with_capacity(self.name.len() + 5);
        var.push_str("RILL_");
        for ch in self.name.chars() {
            var.push(match ch {
                '-' => '_',
                other => other.to_ascii_uppercase(),
            });
        }
        var
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.name)
    }
}

/// 操作符缓冲容量。
pub const BUFFER_SIZE: ConfigKey = ConfigKey::new("stream", "buffer-size");
/// 是否周期性清扫已取消的定时任务。
pub const PURGE_ENABLED: ConfigKey = ConfigKey::new("scheduler", "purge-enabled");
/// 清扫周期（秒）。
pub const PURGE_PERIOD_SECONDS: ConfigKey = ConfigKey::new("scheduler", "purge-period-seconds");

/// 配置解析错误；仅用于钩子上报与测试断言。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    key: ConfigKey,
    raw: Cow<'static, str>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?} for config key {}", self.raw, self.key)
    }
}

impl std::error::Error for ConfigError {}

/// 启动期定格的配置快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    buffer_size: usize,
    purge_enabled: bool,
    purge_period: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128,
            purge_enabled: true,
            purge_period: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    /// 操作符缺省缓冲容量（`prefetch` 未显式指定时同样采用该值）。
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn purge_enabled(&self) -> bool {
        self.purge_enabled
    }

    pub fn purge_period(&self) -> Duration {
        self.purge_period
    }

    /// 从环境风味的键值访问器解析配置；非法取值回退默认并上报钩子。
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(&BUFFER_SIZE.env_var()) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.buffer_size = size,
                _ => report_invalid(BUFFER_SIZE, raw),
            }
        }
        if let Some(raw) = lookup(&PURGE_ENABLED.env_var()) {
            match parse_bool(raw.trim()) {
                Some(enabled) => config.purge_enabled = enabled,
                None => report_invalid(PURGE_ENABLED, raw),
            }
        }
        if let Some(raw) = lookup(&PURGE_PERIOD_SECONDS.env_var()) {
            match raw.trim().parse::<u64>() {
                Ok(seconds) if seconds > 0 => config.purge_period = Duration::from_secs(seconds),
                _ => report_invalid(PURGE_PERIOD_SECONDS, raw),
            }
        }
        config
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn report_invalid(key: ConfigKey, raw: String) {
    hook::on_error(
        RillError::protocol("config.invalid_value", "configuration value rejected").with_cause(
            ConfigError {
                key,
                raw: Cow::Owned(raw),
            },
        ),
    );
}

static SNAPSHOT: OnceLock<RuntimeConfig> = OnceLock::new();

/// 进程级配置快照；首次访问时从环境变量定格。
pub fn runtime() -> &'static RuntimeConfig {
    SNAPSHOT.get_or_init(|| RuntimeConfig::from_lookup(|var| std::env::var(var).ok()))
}

/// 缺省缓冲容量的便捷访问器。
pub fn buffer_size() -> usize {
    runtime().buffer_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 键名到环境变量的映射必须稳定。
    #[test]
    fn key_maps_to_env_var() {
        assert_eq!(BUFFER_SIZE.env_var(), "RILL_BUFFER_SIZE");
        assert_eq!(PURGE_ENABLED.env_var(), "RILL_PURGE_ENABLED");
        assert_eq!(PURGE_PERIOD_SECONDS.env_var(), "RILL_PURGE_PERIOD_SECONDS");
        assert_eq!(BUFFER_SIZE.to_string(), "stream.buffer-size");
    }

    /// 未设置任何变量时取默认值。
    #[test]
    fn defaults_apply_without_env() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config.buffer_size(), 128);
        assert!(config.purge_enabled());
        assert_eq!(config.purge_period(), Duration::from_secs(1));
    }

    /// 合法取值覆盖默认；非法取值回退默认。
    #[test]
    fn parses_and_falls_back() {
        let config = RuntimeConfig::from_lookup(|var| match var {
            "RILL_BUFFER_SIZE" => Some("256".into()),
            "RILL_PURGE_ENABLED" => Some("off".into()),
            "RILL_PURGE_PERIOD_SECONDS" => Some("7".into()),
            _ => None,
        });
        assert_eq!(config.buffer_size(), 256);
        assert!(!config.purge_enabled());
        assert_eq!(config.purge_period(), Duration::from_secs(7));

        let broken = RuntimeConfig::from_lookup(|var| match var {
            "RILL_BUFFER_SIZE" => Some("zero".into()),
            "RILL_PURGE_PERIOD_SECONDS" => Some("0".into()),
            _ => None,
        });
        assert_eq!(broken.buffer_size(), 128, "非法缓冲容量必须回退默认值");
        assert_eq!(broken.purge_period(), Duration::from_secs(1), "零周期必须回退默认值");
    }
}
