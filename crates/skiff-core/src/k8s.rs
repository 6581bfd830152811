//! クラスタオブジェクト
//!
//! YAMLドキュメントそのものは解釈せずに保持し、リソース組み立てに必要な
//! 情報（イメージ参照、Pod テンプレートのラベル、セレクタ）だけを抽出します。

use crate::error::Result;
use crate::model::ImageRef;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub type Labels = BTreeMap<String, String>;

/// コンテナ一覧を持つキー
const CONTAINER_KEYS: [&str; 2] = ["containers", "initContainers"];

/// クラスタオブジェクト（不透明なドキュメント + 導出情報）
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    document: Value,
    images: Vec<ImageRef>,
    labels: Labels,
    pod_template_labels: Vec<Labels>,
    selector: Labels,
}

impl ClusterObject {
    /// ドキュメントから導出情報を計算して作成
    pub fn from_document(document: Value) -> Self {
        let mut images = Vec::new();
        collect_images(&document, &mut images);

        let labels = lookup(&document, &["metadata", "labels"])
            .map(to_labels)
            .unwrap_or_default();

        let mut pod_template_labels = Vec::new();
        for path in [
            &["spec", "template", "metadata", "labels"][..],
            &["spec", "jobTemplate", "spec", "template", "metadata", "labels"][..],
        ] {
            if let Some(v) = lookup(&document, path) {
                let l = to_labels(v);
                if !l.is_empty() {
                    pod_template_labels.push(l);
                }
            }
        }

        let selector = match lookup(&document, &["spec", "selector"]) {
            Some(sel) => match lookup(sel, &["matchLabels"]) {
                Some(ml) => to_labels(ml),
                None => to_labels(sel),
            },
            None => Labels::new(),
        };

        Self {
            document,
            images,
            labels,
            pod_template_labels,
            selector,
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn kind(&self) -> &str {
        lookup(&self.document, &["kind"])
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        lookup(&self.document, &["metadata", "name"])
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// 含まれるイメージ参照
    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    /// 正規化名 `image_name` のイメージを参照しているか
    pub fn references_image(&self, image_name: &str) -> bool {
        self.images.iter().any(|i| i.name() == image_name)
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Pod テンプレートのラベル
    pub fn pod_template_labels(&self) -> &[Labels] {
        &self.pod_template_labels
    }

    pub fn selector(&self) -> &Labels {
        &self.selector
    }

    /// Pod テンプレートのラベルに対応するオブジェクトか
    ///
    /// セレクタが空でなくすべてのエントリが `labels` に含まれる場合、または
    /// 自身の metadata ラベルが `labels` をすべて含む場合に一致する。
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        if labels.is_empty() {
            return false;
        }
        let selector_match =
            !self.selector.is_empty() && self.selector.iter().all(|(k, v)| labels.get(k) == Some(v));
        let label_match = labels.iter().all(|(k, v)| self.labels.get(k) == Some(v));
        selector_match || label_match
    }
}

/// 複数ドキュメントのYAMLをパース
///
/// 空のドキュメントは読み飛ばす。
pub fn parse_yaml(text: &str) -> Result<Vec<ClusterObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        objects.push(ClusterObject::from_document(value));
    }
    debug!(count = objects.len(), "Parsed cluster objects");
    Ok(objects)
}

/// オブジェクト群を `---` 区切りのYAMLにシリアライズ
pub fn serialize_yaml(objects: &[ClusterObject]) -> Result<String> {
    let mut out = String::new();
    for (i, obj) in objects.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(obj.document())?);
    }
    Ok(out)
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn to_labels(value: &Value) -> Labels {
    value
        .as_mapping()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), scalar_string(v)?)))
                .collect()
        })
        .unwrap_or_default()
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn collect_images(value: &Value, out: &mut Vec<ImageRef>) {
    match value {
        Value::Mapping(m) => {
            for key in CONTAINER_KEYS {
                if let Some(Value::Sequence(containers)) = m.get(key) {
                    for c in containers {
                        push_container_image(c, out);
                    }
                }
            }
            for (_, v) in m.iter() {
                collect_images(v, out);
            }
        }
        Value::Sequence(seq) => {
            for v in seq {
                collect_images(v, out);
            }
        }
        Value::Tagged(tagged) => collect_images(&tagged.value, out),
        _ => {}
    }
}

fn push_container_image(container: &Value, out: &mut Vec<ImageRef>) {
    let Some(image) = container
        .as_mapping()
        .and_then(|m: &Mapping| m.get("image"))
        .and_then(Value::as_str)
    else {
        return;
    };
    match ImageRef::parse(image) {
        Ok(r) => {
            if !out.contains(&r) {
                out.push(r);
            }
        }
        Err(e) => debug!(image, error = %e, "Skipping unparsable container image"),
    }
}
