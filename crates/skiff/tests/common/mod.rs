use bytes::Bytes;
use futures_util::stream;
use skiff_build::stream::decode_stream;
use skiff_build::{ImageBuildOptions, ImageBuilder, ImageService, MessageStream, PushAuth, RegistryAuth};
use skiff_core::{
    BuildOptions, Cmd, ConfigEvaluator, CustomBuild, Declarations, FastBuild, FlowError, ImageRef,
    Mount, PortForward, StaticBuild,
};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

pub const DEFAULT_BUILD_OUTPUT: &str = r#"
{"stream":"Step 1/2 : FROM alpine\n"}
{"aux":{"ID":"sha256:0123456789abcdef0123456789abcdef"}}
{"stream":"Successfully built 0123456789ab\n"}
"#;

pub const DEFAULT_PUSH_OUTPUT: &str = r#"
{"status":"Pushed","id":"layer"}
{"aux":{"Tag":"tilt-0123456789abcdef","Digest":"sha256:feedfeed","Size":512}}
"#;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_skifffile(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("Skifffile");
        fs::write(&path, content).unwrap();
        path
    }

    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// 存在しない config.json を使う認証（ホームの設定を読まない）
    #[allow(dead_code)]
    pub fn registry_auth(&self) -> RegistryAuth {
        RegistryAuth::with_config_path(self.root.path().join("docker").join("config.json"))
    }
}

/// 1行1宣言のテスト用評価器
///
/// ```text
/// fast_build <image> <base dockerfile>
/// add <local> <container>
/// run <shell>
/// entrypoint <shell>
/// docker_build <image> <dir>
/// custom_build <image> <command>
/// k8s_yaml <file>
/// k8s_resource <name> [image]
/// port_forward <resource> <local> [container]
/// ```
pub struct LineEvaluator;

impl ConfigEvaluator for LineEvaluator {
    fn evaluate(&self, path: &Path, decls: &mut dyn Declarations) -> skiff_core::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let text = fs::read_to_string(path)?;
        let mut pending: Option<(String, FastBuild)> = None;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            let args: Vec<&str> = rest.split_whitespace().collect();

            if let Some((_, fast)) = pending.as_mut() {
                match cmd {
                    "add" => {
                        fast.mounts.push(Mount {
                            local_path: dir.join(arg(&args, 0)?),
                            container_path: arg(&args, 1)?.to_string(),
                        });
                        continue;
                    }
                    "run" => {
                        fast.steps.push(Cmd::shell(rest));
                        continue;
                    }
                    "entrypoint" => {
                        fast.entrypoint = Cmd::shell(rest);
                        continue;
                    }
                    _ => {}
                }
            }
            if let Some((image, fast)) = pending.take() {
                decls.fast_build(&image, fast, BuildOptions::default())?;
            }

            match cmd {
                "fast_build" => {
                    let base_dockerfile = fs::read_to_string(dir.join(arg(&args, 1)?))?;
                    pending = Some((
                        arg(&args, 0)?.to_string(),
                        FastBuild {
                            base_dockerfile,
                            ..Default::default()
                        },
                    ));
                }
                "docker_build" => {
                    let build_path = dir.join(arg(&args, 1)?);
                    let dockerfile = fs::read_to_string(build_path.join("Dockerfile"))?;
                    decls.docker_build(
                        arg(&args, 0)?,
                        StaticBuild {
                            dockerfile,
                            build_path,
                            build_args: Vec::new(),
                        },
                        BuildOptions::default(),
                    )?;
                }
                "custom_build" => {
                    let (image, command) = rest.split_once(' ').unwrap_or((rest, ""));
                    decls.custom_build(
                        image,
                        CustomBuild {
                            command: command.to_string(),
                            ..Default::default()
                        },
                        BuildOptions::default(),
                    )?;
                }
                "k8s_yaml" => {
                    let yaml = fs::read_to_string(dir.join(arg(&args, 0)?))?;
                    decls.k8s_yaml(&yaml)?;
                }
                "k8s_resource" => decls.k8s_resource(arg(&args, 0)?, args.get(1).copied())?,
                "port_forward" => {
                    let local = port(arg(&args, 1)?)?;
                    let container = args.get(2).map(|p| port(p)).transpose()?;
                    decls.port_forward(arg(&args, 0)?, PortForward::new(local, container))?;
                }
                other => {
                    return Err(FlowError::InvalidConfig(format!("unknown builtin: {}", other)));
                }
            }
        }

        if let Some((image, fast)) = pending {
            decls.fast_build(&image, fast, BuildOptions::default())?;
        }
        Ok(())
    }
}

fn arg<'a>(args: &[&'a str], index: usize) -> skiff_core::Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| FlowError::InvalidConfig(format!("missing argument {}", index)))
}

fn port(s: &str) -> skiff_core::Result<u16> {
    s.parse()
        .map_err(|_| FlowError::InvalidConfig(format!("invalid port: {}", s)))
}

/// 出力を順に返すサービス
///
/// キューが空になったら既定の出力を返す。
#[derive(Default)]
pub struct FakeService {
    pub build_outputs: Mutex<VecDeque<String>>,
    pub builds: Mutex<Vec<ImageBuildOptions>>,
    pub tags: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<String>>,
}

impl FakeService {
    #[allow(dead_code)]
    pub fn with_build_outputs(outputs: &[&str]) -> Self {
        Self {
            build_outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    fn messages(text: &str) -> MessageStream {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(text.to_string()))];
        decode_stream(stream::iter(chunks))
    }
}

impl ImageService for FakeService {
    async fn build(
        &self,
        _context: Vec<u8>,
        options: ImageBuildOptions,
    ) -> skiff_build::BuildResult<MessageStream> {
        self.builds.lock().unwrap().push(options);
        let output = self
            .build_outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| DEFAULT_BUILD_OUTPUT.to_string());
        Ok(Self::messages(&output))
    }

    async fn push(&self, image: &ImageRef, _auth: PushAuth) -> skiff_build::BuildResult<MessageStream> {
        self.pushes.lock().unwrap().push(image.to_string());
        Ok(Self::messages(DEFAULT_PUSH_OUTPUT))
    }

    async fn tag(&self, _source: &str, target: &ImageRef) -> skiff_build::BuildResult<()> {
        self.tags.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

#[allow(dead_code)]
pub fn fake_builder(project: &TestProject, service: FakeService) -> ImageBuilder<FakeService> {
    ImageBuilder::new(service).with_auth(project.registry_auth())
}
