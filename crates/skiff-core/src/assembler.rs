//! リソース組み立て
//!
//! 設定ファイルの評価中に宣言されたイメージとクラスタオブジェクトを
//! [`ResourceGroup`] にまとめ、[`Manifest`] に変換します。
//!
//! 組み立ては決定的で、宣言順だけに依存します:
//! 1. 未割り当てオブジェクトが参照する登録済みイメージを出現順に列挙
//! 2. イメージごとに格納先グループを決定し、参照オブジェクトを移動
//! 3. 移動したオブジェクトの Pod テンプレートに一致するオブジェクトを推移的に移動
//! 4. 残りはすべて `unresourced` グループへ

use crate::error::{FlowError, Result};
use crate::k8s::{self, ClusterObject, Labels};
use crate::model::{
    BuildDetails, CustomBuild, FastBuild, ImageBuildSpec, ImageRef, Manifest, PortForward,
    ResourceGroup, StaticBuild, mounts_to_path_mappings,
};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 残りのオブジェクトを集めるグループ名
pub const UNRESOURCED_NAME: &str = "unresourced";

/// イメージ宣言の付随情報
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub cache_paths: Vec<String>,
    pub repos: Vec<PathBuf>,
}

/// 設定評価器から呼び出される宣言インターフェース
///
/// 評価器（スクリプトエンジン）は組み込み関数ごとに対応するメソッドを呼ぶ。
pub trait Declarations {
    /// Dockerfile による一括ビルドイメージを登録
    fn docker_build(&mut self, image: &str, build: StaticBuild, options: BuildOptions)
    -> Result<()>;

    /// 高速ビルドイメージを登録
    fn fast_build(&mut self, image: &str, build: FastBuild, options: BuildOptions) -> Result<()>;

    /// カスタムコマンドによるビルドイメージを登録
    fn custom_build(&mut self, image: &str, build: CustomBuild, options: BuildOptions)
    -> Result<()>;

    /// YAMLテキストからクラスタオブジェクトを登録
    fn k8s_yaml(&mut self, yaml: &str) -> Result<()>;

    /// 名前付きの空リソースを宣言（任意でイメージを紐付け）
    fn k8s_resource(&mut self, name: &str, image: Option<&str>) -> Result<()>;

    /// リソースにポートフォワードを追加
    fn port_forward(&mut self, resource: &str, port_forward: PortForward) -> Result<()>;
}

/// 宣言の蓄積状態
#[derive(Debug, Clone, Default)]
pub struct AssemblerState {
    current_file: PathBuf,
    config_files: Vec<PathBuf>,
    images: IndexMap<String, ImageBuildSpec>,
    groups: IndexMap<String, ResourceGroup>,
    declared_resources: HashSet<String>,
    unassigned: Vec<ClusterObject>,
}

impl AssemblerState {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        let filename = filename.into();
        Self {
            current_file: filename.clone(),
            config_files: vec![filename],
            ..Default::default()
        }
    }

    /// 評価中のファイルを切り替える（以降のイメージ宣言の出所になる）
    pub fn set_current_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.config_files.contains(&path) {
            self.config_files.push(path.clone());
        }
        self.current_file = path;
    }

    /// 読み込まれた設定ファイル
    pub fn config_files(&self) -> &[PathBuf] {
        &self.config_files
    }

    pub fn current_file(&self) -> &Path {
        &self.current_file
    }

    /// 登録済みイメージ（宣言順）
    pub fn images(&self) -> impl Iterator<Item = &ImageBuildSpec> {
        self.images.values()
    }

    pub fn image(&self, name: &str) -> Option<&ImageBuildSpec> {
        self.images.get(name)
    }

    /// 宣言済みグループ（宣言順）
    pub fn groups(&self) -> impl Iterator<Item = &ResourceGroup> {
        self.groups.values()
    }

    pub fn unassigned(&self) -> &[ClusterObject] {
        &self.unassigned
    }

    /// パース済みオブジェクトを登録
    pub fn add_objects(&mut self, objects: impl IntoIterator<Item = ClusterObject>) {
        self.unassigned.extend(objects);
    }

    fn add_image(&mut self, spec: ImageBuildSpec) -> Result<()> {
        spec.validate()?;
        let name = spec.name();
        if self.images.contains_key(&name) {
            return Err(FlowError::DuplicateImage(spec.image.to_string()));
        }
        debug!(image = %spec.image, "Registered image");
        self.images.insert(name, spec);
        Ok(())
    }

    fn image_spec(
        &self,
        image: &str,
        details: BuildDetails,
        options: BuildOptions,
    ) -> Result<ImageBuildSpec> {
        Ok(
            ImageBuildSpec::new(ImageRef::parse(image)?, details, self.current_file.clone())
                .with_cache_paths(options.cache_paths)
                .with_repos(options.repos),
        )
    }

    /// 宣言をリソースグループにまとめる
    ///
    /// 状態は変更しないため、同じ宣言に対して何度呼んでも同じ結果になる。
    pub fn assemble(&self) -> Result<Vec<ResourceGroup>> {
        let mut groups = self.groups.clone();
        let mut unassigned = self.unassigned.clone();

        let images = self.find_unresourced_images(&unassigned)?;
        for image in &images {
            let target = find_expand_target(&mut groups, image);
            let group = &mut groups[&target];
            extract_image(group, &mut unassigned, &image.name(), &self.images);
            info!(
                image = %image,
                resource = %target,
                objects = group.objects.len(),
                "Assembled resource"
            );
        }

        // 最後に残ったものをすべて追加
        if !unassigned.is_empty() {
            debug!(count = unassigned.len(), "Adding unresourced objects");
            groups
                .entry(UNRESOURCED_NAME.to_string())
                .or_insert_with(|| ResourceGroup::new(UNRESOURCED_NAME))
                .objects
                .append(&mut unassigned);
        }

        Ok(groups.into_values().collect())
    }

    /// 未割り当てオブジェクトが参照する登録済みイメージを出現順に列挙
    fn find_unresourced_images(&self, unassigned: &[ClusterObject]) -> Result<Vec<ImageRef>> {
        let mut result: Vec<ImageRef> = Vec::new();
        let mut seen = HashSet::new();

        for obj in unassigned {
            let mut object_images: Vec<&ImageRef> = Vec::new();
            for image in obj.images() {
                if self.images.contains_key(&image.name())
                    && !object_images.iter().any(|i| i.name() == image.name())
                {
                    object_images.push(image);
                }
            }

            match object_images.as_slice() {
                [] => continue,
                [image] => {
                    if seen.insert(image.name()) {
                        result.push(image.untagged());
                    }
                }
                _ => {
                    let object = k8s::serialize_yaml(std::slice::from_ref(obj))
                        .unwrap_or_else(|e| e.to_string());
                    return Err(FlowError::AmbiguousImages {
                        images: object_images.iter().map(|i| i.name()).collect(),
                        object,
                    });
                }
            }
        }
        Ok(result)
    }

    /// グループをマニフェストに変換
    pub fn translate(&self, groups: &[ResourceGroup]) -> Result<Vec<Manifest>> {
        groups.iter().map(|g| self.translate_group(g)).collect()
    }

    fn translate_group(&self, group: &ResourceGroup) -> Result<Manifest> {
        let mut m = Manifest::new(&group.name);
        m.k8s_yaml = k8s::serialize_yaml(&group.objects)?;
        m.port_forwards = group.port_forwards.clone();

        let Some(image_ref) = &group.image_ref else {
            return Ok(m);
        };
        let image = self.images.get(image_ref).ok_or_else(|| {
            FlowError::InvalidConfig(format!(
                "リソース '{}' のイメージ '{}' が登録されていません",
                group.name, image_ref
            ))
        })?;

        if let Some(fb) = image.maybe_fast_build() {
            m.mounts = mounts_to_path_mappings(&fb.mounts);
            m.entrypoint = fb.entrypoint.clone();
            m.steps = fb.steps.clone();
            m.base_dockerfile = fb.base_dockerfile.clone();
        }
        if let Some(sb) = image.maybe_static_build() {
            m.static_dockerfile = sb.dockerfile.clone();
            m.static_build_path = sb.build_path.clone();
            m.static_build_args = sb.build_args.clone();
        }
        m.docker_ref = Some(image.image.clone());
        m.build_kind = Some(image.details.kind());
        m.cache_paths = image.cache_paths.clone();
        m.config_file = Some(image.config_file.clone());
        m.repos = image.repos.clone();
        Ok(m)
    }

    /// assemble と translate をまとめて実行
    pub fn manifests(&self) -> Result<Vec<Manifest>> {
        let groups = self.assemble()?;
        self.translate(&groups)
    }
}

impl Declarations for AssemblerState {
    fn docker_build(
        &mut self,
        image: &str,
        build: StaticBuild,
        options: BuildOptions,
    ) -> Result<()> {
        let spec = self.image_spec(image, BuildDetails::Static(build), options)?;
        self.add_image(spec)
    }

    fn fast_build(&mut self, image: &str, build: FastBuild, options: BuildOptions) -> Result<()> {
        let spec = self.image_spec(image, BuildDetails::Fast(build), options)?;
        self.add_image(spec)
    }

    fn custom_build(
        &mut self,
        image: &str,
        build: CustomBuild,
        options: BuildOptions,
    ) -> Result<()> {
        let spec = self.image_spec(image, BuildDetails::Custom(build), options)?;
        self.add_image(spec)
    }

    fn k8s_yaml(&mut self, yaml: &str) -> Result<()> {
        let objects = k8s::parse_yaml(yaml)?;
        self.add_objects(objects);
        Ok(())
    }

    fn k8s_resource(&mut self, name: &str, image: Option<&str>) -> Result<()> {
        if !self.declared_resources.insert(name.to_string()) {
            return Err(FlowError::DuplicateResource(name.to_string()));
        }
        let image_ref = image
            .map(|i| ImageRef::parse(i).map(|r| r.name()))
            .transpose()?;
        let group = self
            .groups
            .entry(name.to_string())
            .or_insert_with(|| ResourceGroup::new(name));
        group.image_ref = image_ref;
        Ok(())
    }

    fn port_forward(&mut self, resource: &str, port_forward: PortForward) -> Result<()> {
        self.groups
            .entry(resource.to_string())
            .or_insert_with(|| ResourceGroup::new(resource))
            .port_forwards
            .push(port_forward);
        Ok(())
    }
}

/// イメージの格納先グループを決定（必要なら作成）してキーを返す
///
/// 優先順位:
/// 1. 同じイメージが紐付けられた空のグループ
/// 2. イメージのベース名と同名の空のグループ
/// 3. 新しいグループ
fn find_expand_target(groups: &mut IndexMap<String, ResourceGroup>, image: &ImageRef) -> String {
    let name = image.name();
    if let Some(g) = groups
        .values()
        .find(|g| g.is_empty() && g.image_ref.as_deref() == Some(name.as_str()))
    {
        return g.name.clone();
    }

    let base = image.base_name();
    if let Some(g) = groups.values().find(|g| g.is_empty() && g.name == base) {
        return g.name.clone();
    }

    // ベース名が使用済みならイメージ名全体、それも使用済みなら連番を付ける
    let mut candidate = base.to_string();
    if groups.contains_key(&candidate) {
        candidate = name.clone();
    }
    let mut n = 2;
    while groups.contains_key(&candidate) {
        candidate = format!("{}-{}", name, n);
        n += 1;
    }
    groups.insert(candidate.clone(), ResourceGroup::new(candidate.clone()));
    candidate
}

/// イメージを参照するオブジェクトと、その Pod テンプレートに一致する
/// オブジェクトをグループに移動
///
/// 別の宣言済みイメージを参照するオブジェクトはラベルが一致しても移動しない。
fn extract_image(
    group: &mut ResourceGroup,
    unassigned: &mut Vec<ClusterObject>,
    image_name: &str,
    declared: &IndexMap<String, ImageBuildSpec>,
) {
    let owned_elsewhere = |o: &ClusterObject| {
        o.images()
            .iter()
            .any(|i| i.name() != image_name && declared.contains_key(&i.name()))
    };

    let mut moved = take_matching(unassigned, |o| o.references_image(image_name));

    while !moved.is_empty() {
        let templates: Vec<Labels> = moved
            .iter()
            .flat_map(|o| o.pod_template_labels().iter().cloned())
            .collect();
        group.objects.append(&mut moved);

        for labels in &templates {
            moved.extend(take_matching(unassigned, |o| {
                o.matches_labels(labels) && !owned_elsewhere(o)
            }));
        }
    }

    group.image_ref = Some(image_name.to_string());
}

/// 条件に一致するオブジェクトを順序を保って取り出す
fn take_matching(
    objects: &mut Vec<ClusterObject>,
    pred: impl Fn(&ClusterObject) -> bool,
) -> Vec<ClusterObject> {
    let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(objects).into_iter().partition(pred);
    *objects = rest;
    matched
}
