//! # ProtocolRegistry：协议提供者注册表
//!
//! ## 核心意图（Why）
//! - 多个控制器（controller）可以为同一 `(protocol, realm)` 发布实现，调用方需要按协议定位提供者；
//! - 控制器下线时必须一次性撤销它提供的全部协议，因此同时维护反向索引。
//!
//! ## 行为契约（What）
//! - 主表：`protocol@realm` → 提供者集合；条目存在当且仅当集合非空；
//! - 反向索引：控制器 → 协议键集合；`key ∈ index[c]` 当且仅当 `c ∈ protocols[key]`；
//! - 每个协议条目另有一组频道名，随条目一起创建与删除；
//! - 两张表共享一把 `parking_lot::RwLock`：`controller_add`/`controller_remove` 取写锁，`lookup` 取读锁；
//! - `lookup` 返回拥有所有权的 [`ProtocolSnapshot`]，持有快照不会阻塞写者，也不会因后续删除而悬挂。
//!
//! ## 风险提示（Trade-offs）
//! - 两表不一致属于程序缺陷，移除路径上检测到时直接 panic，而不是向调用方报告。

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::BladeError;

/// 组合 `protocol@realm` 注册键。
pub fn protocol_key(protocol: &str, realm: &str) -> String {
    format!("{protocol}@{realm}")
}

#[derive(Debug)]
struct ProtocolEntry {
    protocol: Arc<str>,
    realm: Arc<str>,
    providers: BTreeSet<Arc<str>>,
    channels: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct RegistryMaps {
    protocols: HashMap<String, ProtocolEntry>,
    controllers: HashMap<Arc<str>, HashSet<String>>,
}

/// 协议条目在查询时刻的只读快照。
///
/// # 教案式说明
/// - **意图 (Why)**：查询结果脱离读锁后依然安全可用，调用方无需额外“钉住”注册表；
/// - **契约 (What)**：提供者与频道均按字典序排列；快照不会反映查询之后的增删。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolSnapshot {
    protocol: Arc<str>,
    realm: Arc<str>,
    providers: Vec<Arc<str>>,
    channels: Vec<String>,
}

impl ProtocolSnapshot {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn key(&self) -> String {
        protocol_key(&self.protocol, &self.realm)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(AsRef::as_ref)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn has_provider(&self, controller: &str) -> bool {
        self.providers.iter().any(|p| p.as_ref() == controller)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// 以 JSON 数组打包提供者列表，供定位（locate）类请求直接放入结果。
    pub fn controllers_pack(&self) -> Value {
        Value::Array(
            self.providers
                .iter()
                .map(|p| Value::String(p.to_string()))
                .collect(),
        )
    }
}

/// 协议提供者注册表。
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    maps: RwLock<RegistryMaps>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `controller` 为 `protocol@realm` 的提供者。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：条目不存在时创建；重复登记是无操作；主表与反向索引在同一写锁内更新。
    /// - **返回值**：本次调用是否新增了提供关系。
    pub fn controller_add(&self, protocol: &str, realm: &str, controller: &str) -> bool {
        let key = protocol_key(protocol, realm);
        let mut maps = self.maps.write();
        let controller: Arc<str> = maps
            .controllers
            .get_key_value(controller)
            .map(|(existing, _)| Arc::clone(existing))
            .unwrap_or_else(|| Arc::from(controller));

        let entry = maps
            .protocols
            .entry(key.clone())
            .or_insert_with(|| ProtocolEntry {
                protocol: Arc::from(protocol),
                realm: Arc::from(realm),
                providers: BTreeSet::new(),
                channels: BTreeSet::new(),
            });
        let inserted = entry.providers.insert(Arc::clone(&controller));
        maps.controllers
            .entry(Arc::clone(&controller))
            .or_default()
            .insert(key.clone());

        if inserted {
            debug!(protocol = %key, controller = %controller, "protocol provider added");
        }
        inserted
    }

    /// 为已存在的 `protocol@realm` 登记频道。
    ///
    /// - **契约 (What)**：协议不存在返回 [`BladeError::NotFound`]；返回值表示频道是否为新增；
    ///   协议因最后一个提供者离开而删除时，频道一并删除。
    pub fn channel_add(&self, protocol: &str, realm: &str, channel: &str) -> Result<bool, BladeError> {
        let key = protocol_key(protocol, realm);
        let mut maps = self.maps.write();
        let entry = maps
            .protocols
            .get_mut(&key)
            .ok_or_else(|| BladeError::not_found(key.clone()))?;
        let inserted = entry.channels.insert(channel.to_owned());
        if inserted {
            debug!(protocol = %key, channel, "protocol channel added");
        }
        Ok(inserted)
    }

    /// 撤销 `controller` 提供的全部协议，返回受影响的协议键。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 未登记的控制器是无操作，返回空列表；
    ///   - 提供者集合被清空的协议条目随之删除；
    ///   - 最后删除控制器的反向索引条目。
    /// - **风险 (Trade-offs)**：反向索引指向的协议缺失、或协议中不含该控制器时视为不变量破坏，直接 panic。
    pub fn controller_remove(&self, controller: &str) -> Vec<String> {
        let mut maps = self.maps.write();
        let Some(keys) = maps.controllers.remove(controller) else {
            return Vec::new();
        };

        let mut affected: Vec<String> = keys.into_iter().collect();
        affected.sort();
        for key in &affected {
            let Some(entry) = maps.protocols.get_mut(key) else {
                panic!("protocol registry corrupted: `{controller}` indexes missing protocol `{key}`");
            };
            assert!(
                entry.providers.remove(controller),
                "protocol registry corrupted: `{key}` does not list indexed provider `{controller}`"
            );
            if entry.providers.is_empty() {
                maps.protocols.remove(key);
                debug!(protocol = %key, "protocol removed after last provider left");
            }
        }
        debug!(controller, protocols = affected.len(), "controller removed");
        affected
    }

    /// 查询 `protocol@realm` 的提供者快照。
    pub fn lookup(&self, protocol: &str, realm: &str) -> Result<ProtocolSnapshot, BladeError> {
        let key = protocol_key(protocol, realm);
        let maps = self.maps.read();
        let entry = maps
            .protocols
            .get(&key)
            .ok_or_else(|| BladeError::not_found(key.clone()))?;
        Ok(ProtocolSnapshot {
            protocol: Arc::clone(&entry.protocol),
            realm: Arc::clone(&entry.realm),
            providers: entry.providers.iter().cloned().collect(),
            channels: entry.channels.iter().cloned().collect(),
        })
    }

    /// 控制器当前提供的协议键，按字典序排列。
    pub fn controller_protocols(&self, controller: &str) -> Vec<String> {
        let maps = self.maps.read();
        let mut keys: Vec<String> = maps
            .controllers
            .get(controller)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// 已登记的协议条目数。
    pub fn len(&self) -> usize {
        self.maps.read().protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
