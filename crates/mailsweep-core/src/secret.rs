//! Password acquisition back-ends. Out of scope normatively (the spec
//! only fixes the trait and the one-line-on-stdout contract), but
//! minimal, real implementations are provided for usability.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Yields one UTF-8 secret string. Implementations resolve lazily;
/// callers are expected to cache the result (see `Account::password`).
#[async_trait::async_trait]
pub trait PasswordSource: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

fn trim_trailing_newline(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Reads and trims the first line of a file.
pub struct FileSecretSource {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl PasswordSource for FileSecretSource {
    async fn resolve(&self) -> Result<String> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read secret file {}", self.path.display()))?;
        let first_line =
            contents.lines().next().context("secret file is empty")?.trim().to_string();
        Ok(first_line)
    }
}

/// Spawns a shell command and reads the first trimmed line of its stdout.
pub struct CommandSecretSource {
    pub command: String,
}

#[async_trait::async_trait]
impl PasswordSource for CommandSecretSource {
    async fn resolve(&self) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .context("failed to spawn secret command")?;

        let stdout = child.stdout.take().context("secret command stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        let line = lines
            .next_line()
            .await
            .context("failed to read secret command output")?
            .context("secret command produced no output")?;

        let status = child.wait().await.context("failed to wait for secret command")?;
        if !status.success() {
            bail!("secret command exited with status {status}");
        }

        Ok(trim_trailing_newline(line).trim().to_string())
    }
}

/// Speaks a minimal `GETPIN`/`D`/`OK` subset of the Assuan protocol to
/// an interactive `pinentry` helper.
pub struct PinentrySecretSource {
    pub binary: String,
    pub prompt: String,
}

impl PinentrySecretSource {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { binary: "pinentry".to_string(), prompt: prompt.into() }
    }
}

#[async_trait::async_trait]
impl PasswordSource for PinentrySecretSource {
    async fn resolve(&self) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let mut stdin = child.stdin.take().context("pinentry stdin not captured")?;
        let stdout = child.stdout.take().context("pinentry stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        // Discard the greeting line.
        let _ = lines.next_line().await;

        let set_prompt = format!("SETPROMPT {}\n", self.prompt.replace('\n', " "));
        stdin.write_all(set_prompt.as_bytes()).await.context("failed to write to pinentry")?;
        let _ = lines.next_line().await;

        stdin.write_all(b"GETPIN\n").await.context("failed to write GETPIN to pinentry")?;

        let mut pin = None;
        while let Some(line) = lines.next_line().await.context("failed to read from pinentry")? {
            if let Some(value) = line.strip_prefix("D ") {
                pin = Some(value.to_string());
            } else if line.starts_with("OK") {
                break;
            } else if let Some(reason) = line.strip_prefix("ERR ") {
                bail!("pinentry reported an error: {reason}");
            }
        }

        let _ = stdin.shutdown().await;
        let _ = child.wait().await;

        pin.context("pinentry did not return a pin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_secret_source_reads_trimmed_first_line() {
        let dir = std::env::temp_dir().join(format!("mailsweep-secret-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("pass.txt");
        tokio::fs::write(&path, "hunter2  \nignored-second-line\n").await.unwrap();

        let source = FileSecretSource { path: path.clone() };
        let resolved = source.resolve().await.unwrap();
        assert_eq!(resolved, "hunter2");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn command_secret_source_reads_first_stdout_line() {
        let source = CommandSecretSource { command: "printf 'sekrit\\nextra\\n'".to_string() };
        let resolved = source.resolve().await.unwrap();
        assert_eq!(resolved, "sekrit");
    }

    #[tokio::test]
    async fn command_secret_source_fails_on_nonzero_exit() {
        let source = CommandSecretSource { command: "exit 1".to_string() };
        assert!(source.resolve().await.is_err());
    }
}
