//! 可合并的运行元数据
//!
//! 同一回合内多次工具调用、以及跨子智能体边界的结果，都要折叠成一份汇总。
//! 合并必须满足结合律与交换律：并发执行时结果到达顺序不影响汇总。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::memory::{Message, TokenUsage};

/// 显式合并操作（结合律 + 交换律）
pub trait Merge {
    fn merge(&mut self, other: Self);
}

impl Merge for u64 {
    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

impl<K: Ord, V: Merge> Merge for BTreeMap<K, V> {
    fn merge(&mut self, other: Self) {
        for (k, v) in other {
            match self.get_mut(&k) {
                Some(existing) => existing.merge(v),
                None => {
                    self.insert(k, v);
                }
            }
        }
    }
}

impl<T: Ord> Merge for BTreeSet<T> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

/// 子智能体一次运行的留档：对话历史与其自身汇总
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubAgentTrace {
    pub agent: String,
    pub messages: Vec<Message>,
    pub metadata: RunMetadata,
}

impl SubAgentTrace {
    /// 合并时的全序：先比历史长度，再比序列化内容
    fn rank(&self) -> (usize, String) {
        (self.messages.len(), serde_json::to_string(self).unwrap_or_default())
    }
}

impl Merge for SubAgentTrace {
    /// 同一 call_id 只应有一份留档；冲突时取 rank 较大者，结果与合并顺序无关
    fn merge(&mut self, other: Self) {
        if other.rank() > self.rank() {
            *self = other;
        }
    }
}

/// 运行元数据汇总
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// 各工具调用次数
    #[serde(default)]
    pub tool_use: BTreeMap<String, u64>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// 通用计数器（命令执行、超时、拒绝等）
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// 跨沙箱传输过的文件
    #[serde(default)]
    pub files_transferred: BTreeSet<String>,
    /// 子智能体留档，按 call_id 索引
    #[serde(default)]
    pub sub_agents: BTreeMap<String, SubAgentTrace>,
}

impl RunMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_used(name: &str) -> Self {
        let mut m = Self::default();
        m.tool_use.insert(name.to_string(), 1);
        m
    }

    pub fn counter(name: &str, value: u64) -> Self {
        let mut m = Self::default();
        m.counters.insert(name.to_string(), value);
        m
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            token_usage: usage,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Merge for RunMetadata {
    fn merge(&mut self, other: Self) {
        self.tool_use.merge(other.tool_use);
        self.token_usage.merge(other.token_usage);
        self.counters.merge(other.counters);
        self.files_transferred.merge(other.files_transferred);
        self.sub_agents.merge(other.sub_agents);
    }
}

/// 折叠任意多份元数据
pub fn aggregate(items: impl IntoIterator<Item = RunMetadata>) -> RunMetadata {
    items.into_iter().fold(RunMetadata::default(), |mut acc, m| {
        acc.merge(m);
        acc
    })
}
