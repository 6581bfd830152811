//! リソースグループ定義

use crate::k8s::ClusterObject;
use serde::{Deserialize, Serialize};

/// ポートフォワード設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub local_port: u16,
    pub container_port: u16,
}

impl PortForward {
    /// コンテナポート未指定時はローカルポートと同じ
    pub fn new(local_port: u16, container_port: Option<u16>) -> Self {
        Self {
            local_port,
            container_port: container_port.unwrap_or(local_port),
        }
    }
}

/// 1つのデプロイ単位にまとめられたクラスタオブジェクト群
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGroup {
    pub name: String,
    pub objects: Vec<ClusterObject>,
    /// 紐付けられたイメージの正規化名（最大1つ）
    pub image_ref: Option<String>,
    pub port_forwards: Vec<PortForward>,
}

impl ResourceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
