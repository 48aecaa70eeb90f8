//! Backend configuration types.
//!
//! Mirrors the teacher's tagged-optional-sections shape: a `backend`
//! discriminant selects which one of the `Option<XxxConfig>` fields the
//! factory reads. Credential acquisition is handled by a caller-supplied
//! [`crate::credentials::Credentials`], not by this config -- these
//! structs carry only the addressing fields each backend's wire
//! protocol needs (bucket, container, registry path, repo), not
//! secrets.

use serde::Deserialize;

/// Top-level backend selection, typically deserialized from a small
/// YAML or JSON document alongside the caller's own configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend discriminant: `oci`, `s3`, `gs`, `azure`, `github`, or `memory`.
    pub backend: String,

    #[serde(default)]
    pub oci: Option<OciStorageConfig>,
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,
    #[serde(default)]
    pub gcp: Option<GcpStorageConfig>,
    #[serde(default)]
    pub azure: Option<AzureStorageConfig>,
    #[serde(default)]
    pub github: Option<GithubStorageConfig>,
    #[serde(default)]
    pub memory: Option<MemoryStorageConfig>,
}

/// OCI-style namespaced registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OciStorageConfig {
    /// Registry host, e.g. `registry.example.com`.
    pub registry: String,
    /// Repository path within the registry, e.g. `my-team/models`.
    pub repository: String,
}

/// S3-style gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Force path-style URL addressing, required by most non-AWS S3-compatible gateways.
    #[serde(default)]
    pub use_path_style: bool,
}

/// GCS-style gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GcpStorageConfig {
    pub bucket: String,
}

/// Azure Blob Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureStorageConfig {
    pub container: String,
    pub account: String,
}

/// Git-LFS-backed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubStorageConfig {
    pub owner: String,
    pub repo: String,
    /// Branch, tag, or commit SHA the Contents API and LFS batch calls
    /// target. `ref` is a Rust keyword, hence the rename.
    #[serde(rename = "ref", default = "default_git_ref")]
    pub reference: String,
}

/// In-process test-double configuration. Carries nothing; its presence
/// just selects the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStorageConfig {}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_git_ref() -> String {
    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_aws_section_with_defaults() {
        let json = r#"{"backend":"s3","aws":{"bucket":"my-bucket"}}"#;
        let cfg: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.backend, "s3");
        let aws = cfg.aws.unwrap();
        assert_eq!(aws.bucket, "my-bucket");
        assert_eq!(aws.region, "us-east-1");
        assert!(!aws.use_path_style);
    }

    #[test]
    fn deserializes_oci_section() {
        let json = r#"{"backend":"oci","oci":{"registry":"registry.example.com","repository":"my/repo"}}"#;
        let cfg: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.oci.unwrap().repository, "my/repo");
    }

    #[test]
    fn github_section_defaults_ref_to_main() {
        let json = r#"{"backend":"github","github":{"owner":"octocat","repo":"hello-world"}}"#;
        let cfg: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.github.unwrap().reference, "main");
    }

    #[test]
    fn github_section_honors_explicit_ref() {
        let json = r#"{"backend":"github","github":{"owner":"octocat","repo":"hello-world","ref":"release"}}"#;
        let cfg: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.github.unwrap().reference, "release");
    }
}
