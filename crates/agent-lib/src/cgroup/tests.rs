//! Integration tests for cgroup limit control
//!
//! These tests use a mock cgroup filesystem to exercise path resolution and
//! throttle file writes without requiring a real container runtime.

#[cfg(test)]
mod mock_cgroup_tests {
    use crate::cgroup::{detect_cgroup_version, CgroupLimiter};
    use crate::error::SmartLimitError;
    use crate::models::{CgroupVersion, LimitResult};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::fs;

    const ID: &str = "abc123def456789012345678901234567890123456789012345678901234abcd";

    fn limits() -> LimitResult {
        LimitResult {
            read_iops: 500,
            write_iops: 400,
            read_bps: 0,
            write_bps: 10485760,
        }
    }

    /// Helper to create a mock cgroup v2 container directory
    async fn create_mock_cgroup_v2(temp_dir: &TempDir, parent: &str) -> PathBuf {
        let root = temp_dir.path().to_path_buf();
        fs::write(root.join("cgroup.controllers"), "cpu memory io\n")
            .await
            .unwrap();

        let container_path = root.join(parent.trim_start_matches('/')).join(ID);
        fs::create_dir_all(&container_path).await.unwrap();
        fs::write(container_path.join("io.max"), "").await.unwrap();
        root
    }

    /// Helper to create a mock cgroup v1 blkio container directory
    async fn create_mock_cgroup_v1(temp_dir: &TempDir, parent: &str) -> PathBuf {
        let root = temp_dir.path().to_path_buf();
        let container_path = root
            .join("blkio")
            .join(parent.trim_start_matches('/'))
            .join(ID);
        fs::create_dir_all(&container_path).await.unwrap();
        root
    }

    #[tokio::test]
    async fn test_detect_versions() {
        let v2 = TempDir::new().unwrap();
        let root = create_mock_cgroup_v2(&v2, "/kubepods").await;
        assert_eq!(detect_cgroup_version(&root).await, Some(CgroupVersion::V2));

        let v1 = TempDir::new().unwrap();
        let root = create_mock_cgroup_v1(&v1, "/kubepods").await;
        assert_eq!(detect_cgroup_version(&root).await, Some(CgroupVersion::V1));

        let empty = TempDir::new().unwrap();
        assert_eq!(detect_cgroup_version(empty.path()).await, None);
    }

    #[tokio::test]
    async fn test_v2_set_and_reset_limits() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_cgroup_v2(&temp_dir, "/kubepods/burstable/pod1").await;

        let limiter = CgroupLimiter::detect(&root).await;
        assert_eq!(limiter.version(), CgroupVersion::V2);

        let endpoint = limiter
            .endpoint(ID, "/kubepods/burstable/pod1", "8:0")
            .unwrap();
        limiter.set_limits(&endpoint, &limits()).await.unwrap();

        let written = fs::read_to_string(endpoint.path.join("io.max")).await.unwrap();
        assert_eq!(written, "8:0 riops=500 wiops=400 wbps=10485760");
        assert_eq!(limiter.read_limits(&endpoint).await.unwrap(), limits());

        limiter.reset_limits(&endpoint).await.unwrap();
        let written = fs::read_to_string(endpoint.path.join("io.max")).await.unwrap();
        assert_eq!(written, "8:0 riops=max wiops=max rbps=max wbps=max");
        assert!(limiter.read_limits(&endpoint).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_limits_reports_missing_cgroup() {
        let temp_dir = TempDir::new().unwrap();
        for version in [CgroupVersion::V1, CgroupVersion::V2] {
            let limiter = CgroupLimiter::new(temp_dir.path(), version);
            let endpoint = limiter.endpoint(ID, "/kubepods/gone", "8:0").unwrap();
            assert!(limiter.read_limits(&endpoint).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_v2_systemd_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let scope = root
            .join("kubelet.slice/kubelet-kubepods.slice/kubelet-kubepods-besteffort.slice")
            .join("kubelet-kubepods-besteffort-pod42.slice")
            .join(format!("cri-containerd-{ID}.scope"));
        fs::create_dir_all(&scope).await.unwrap();

        let limiter = CgroupLimiter::new(&root, CgroupVersion::V2);
        let spec = format!("kubelet-kubepods-besteffort-pod42.slice:cri-containerd:{ID}");
        let endpoint = limiter.endpoint(ID, &spec, "259:0").unwrap();
        limiter.set_limits(&endpoint, &limits()).await.unwrap();

        let written = fs::read_to_string(scope.join("io.max")).await.unwrap();
        assert!(written.starts_with("259:0 riops=500"));
    }

    #[tokio::test]
    async fn test_v2_all_zero_limits_skip_write() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_cgroup_v2(&temp_dir, "/kubepods").await;
        let limiter = CgroupLimiter::new(&root, CgroupVersion::V2);
        let endpoint = limiter.endpoint(ID, "/kubepods", "8:0").unwrap();

        limiter
            .set_limits(&endpoint, &LimitResult::default())
            .await
            .unwrap();
        let written = fs::read_to_string(endpoint.path.join("io.max")).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_v1_set_and_reset_limits() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_cgroup_v1(&temp_dir, "kubepods/besteffort/pod9").await;

        let limiter = CgroupLimiter::detect(&root).await;
        assert_eq!(limiter.version(), CgroupVersion::V1);

        let endpoint = limiter
            .endpoint(ID, "kubepods/besteffort/pod9", "8:16")
            .unwrap();
        limiter.set_limits(&endpoint, &limits()).await.unwrap();

        let read_iops = fs::read_to_string(endpoint.path.join("blkio.throttle.read_iops_device"))
            .await
            .unwrap();
        assert_eq!(read_iops, "8:16 500");
        // Zero means unlimited: no rule written for read bps
        assert!(!endpoint
            .path
            .join("blkio.throttle.read_bps_device")
            .exists());
        assert_eq!(limiter.read_limits(&endpoint).await.unwrap(), limits());

        limiter.reset_limits(&endpoint).await.unwrap();
        for file in [
            "blkio.throttle.read_iops_device",
            "blkio.throttle.write_iops_device",
            "blkio.throttle.read_bps_device",
            "blkio.throttle.write_bps_device",
        ] {
            let content = fs::read_to_string(endpoint.path.join(file)).await.unwrap();
            assert_eq!(content, "8:16 0");
        }
    }

    #[tokio::test]
    async fn test_missing_cgroup_directory_is_write_failure() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = CgroupLimiter::new(temp_dir.path(), CgroupVersion::V2);
        let endpoint = limiter.endpoint(ID, "/kubepods/gone", "8:0").unwrap();

        let result = limiter.set_limits(&endpoint, &limits()).await;
        assert!(matches!(result, Err(SmartLimitError::CgroupWrite { .. })));

        let result = limiter.reset_limits(&endpoint).await;
        assert!(matches!(result, Err(SmartLimitError::CgroupWrite { .. })));
    }
}
