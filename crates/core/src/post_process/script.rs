//! Running the operator's post-processing script or binary.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::error::PostProcessError;

/// Shells tried, in order, for scripts without a shebang.
const DEFAULT_SHELLS: [&str; 4] = ["powershell.exe", "bash", "zsh", "sh"];

/// How much of the command file is inspected to pick a launch mode.
const SNIFF_LEN: u64 = 512;

/// How a command file is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Executed directly (binary or shebang script).
    Direct,
    /// Passed as the only argument to the default shell.
    Shell,
}

impl LaunchMode {
    /// Decide from the first bytes of the file.
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(b"#!") || looks_binary(head) {
            LaunchMode::Direct
        } else {
            LaunchMode::Shell
        }
    }
}

/// Control bytes that never appear in text files.
fn looks_binary(head: &[u8]) -> bool {
    head.iter()
        .any(|b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F))
}

/// First shell from [`DEFAULT_SHELLS`] found on `PATH`.
pub fn find_default_shell() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    DEFAULT_SHELLS
        .iter()
        .find_map(|shell| std::env::split_paths(&path).find_map(|dir| executable(&dir.join(shell))))
}

fn executable(candidate: &Path) -> Option<PathBuf> {
    let metadata = std::fs::metadata(candidate).ok()?;
    if !metadata.is_file() {
        return None;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return None;
        }
    }

    Some(candidate.to_path_buf())
}

async fn read_head(command: &str) -> Result<Vec<u8>, PostProcessError> {
    let read_err = |source| PostProcessError::CommandRead {
        path: command.to_string(),
        source,
    };

    let file = tokio::fs::File::open(command).await.map_err(read_err)?;
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    file.take(SNIFF_LEN)
        .read_to_end(&mut head)
        .await
        .map_err(read_err)?;
    Ok(head)
}

/// Run `command` with the process environment plus `env`.
///
/// Returns stdout. A non-zero exit is an error carrying stderr.
pub async fn run_command(
    command: &str,
    env: &[(String, String)],
    default_shell: Option<&Path>,
) -> Result<String, PostProcessError> {
    let head = read_head(command).await?;

    let (program, mut cmd) = match LaunchMode::detect(&head) {
        LaunchMode::Direct => (PathBuf::from(command), Command::new(command)),
        LaunchMode::Shell => {
            let shell =
                default_shell.ok_or_else(|| PostProcessError::NoDefaultShell(command.to_string()))?;
            let mut cmd = Command::new(shell);
            cmd.arg(command);
            (shell.to_path_buf(), cmd)
        }
    };

    let output = cmd
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| PostProcessError::Spawn {
            path: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(PostProcessError::CommandFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
