//! モデル定義
//!
//! skiff で使用されるデータモデルを定義します。

mod build;
mod image;
mod manifest;
mod resource;

// Re-exports
pub use build::*;
pub use image::*;
pub use manifest::*;
pub use resource::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_port_forward_default_container_port() {
        let pf = PortForward::new(8080, None);
        assert_eq!(pf.container_port, 8080);

        let pf = PortForward::new(8080, Some(80));
        assert_eq!(pf.local_port, 8080);
        assert_eq!(pf.container_port, 80);
    }

    #[test]
    fn test_mounts_to_path_mappings() {
        let mounts = vec![
            Mount {
                local_path: PathBuf::from("/src/a"),
                container_path: "/app/a".to_string(),
            },
            Mount {
                local_path: PathBuf::from("/src/b"),
                container_path: "/app/b".to_string(),
            },
        ];
        let mappings = mounts_to_path_mappings(&mounts);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].local_path, PathBuf::from("/src/b"));
        assert_eq!(mappings[1].container_path, "/app/b");
    }

    #[test]
    fn test_manifest_serialization() {
        let mut m = Manifest::new("app");
        m.docker_ref = Some(ImageRef::parse("gcr.io/org/app").unwrap());
        m.steps = vec![Cmd::shell("echo hi")];

        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("gcr.io/org/app"));

        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(back.is_image_bound());
        assert!(!back.is_fast_build());
    }
}
