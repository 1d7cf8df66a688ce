//! # telemetry：全局 `tracing` 订阅器安装
//!
//! ## 核心意图（Why）
//! - 代理核心只通过 `tracing` 宏输出日志，宿主进程调用一次 [`install`] 即可获得带过滤的格式化输出；
//! - 库本身从不隐式安装订阅器，宿主已有自己的订阅器时保持原样。
//!
//! ## 执行约定（How）
//! - 组装 `registry + EnvFilter + fmt`，过滤指令取自 `RUST_LOG`，缺省为 `info`；
//! - 安装状态写入 `OnceLock`，重复调用与外部已设置订阅器分别返回不同错误。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 订阅器安装失败的原因。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `install` 被重复调用。
    #[error("blade telemetry is already installed")]
    AlreadyInstalled,
    /// 外部提前设置了全局订阅器。
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    /// 设置全局订阅器失败的底层错误。
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局订阅器。
///
/// # 教案式说明
/// - **契约 (What)**：成功后进程内全部 `tracing` 事件按 `RUST_LOG` 过滤并输出到标准输出；
///   多次调用返回 [`TelemetryError::AlreadyInstalled`]。
pub fn install() -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
