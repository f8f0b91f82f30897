use std::path::{Path, PathBuf};

use crate::engine::error::RunnerError;

const MAX_CLIENT_ID_LEN: usize = 128;

/// Hands out one directory per client under a shared scratch root.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
}

impl WorkspaceProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, client_id: &str) -> PathBuf {
        self.root.join(client_id)
    }

    pub async fn provision(&self, client_id: &str) -> Result<PathBuf, RunnerError> {
        validate_client_id(client_id)?;
        let dir = self.dir_for(client_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn write_source(
        &self,
        work_dir: &Path,
        file_name: &str,
        code: &str,
    ) -> Result<PathBuf, RunnerError> {
        let path = work_dir.join(file_name);
        tokio::fs::write(&path, code.as_bytes()).await?;
        Ok(path)
    }
}

/// Client ids become a path segment, so only a conservative alphabet is accepted.
pub fn validate_client_id(client_id: &str) -> Result<(), RunnerError> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(RunnerError::InvalidRequest(
            "clientId must be 1-128 characters".to_string(),
        ));
    }
    if !client_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(RunnerError::InvalidRequest(
            "clientId may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{WorkspaceProvisioner, validate_client_id};
    use crate::engine::error::RunnerError;

    #[tokio::test]
    async fn provisioning_is_idempotent_and_overwrites_source() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = WorkspaceProvisioner::new(root.path().join("nested/scratch"));

        let first = provisioner.provision("client-1").await.unwrap();
        let second = provisioner.provision("client-1").await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());

        provisioner
            .write_source(&first, "code.py", "print('one')\nprint('two')\n")
            .await
            .unwrap();
        let path = provisioner
            .write_source(&first, "code.py", "print(1)")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "print(1)");
    }

    #[tokio::test]
    async fn write_failure_surfaces_as_workspace_error() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = WorkspaceProvisioner::new(root.path());
        let missing = root.path().join("never-created");

        let err = provisioner
            .write_source(&missing, "code.js", "console.log(1)")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::WorkspaceIo(_)));
    }

    #[test]
    fn rejects_path_like_client_ids() {
        assert!(validate_client_id("abc_DEF-123").is_ok());
        for bad in ["", "../etc", "a/b", "with space", "dot.dot"] {
            assert!(validate_client_id(bad).is_err(), "{bad} should be rejected");
        }
        assert!(validate_client_id(&"x".repeat(129)).is_err());
    }
}
