//! Fire-and-forget child-process hooks and desktop notifications.
//! Errors here are the `Ignored` failure scope: logged and swallowed.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// Spawns `sh -c <command>` and writes `title\nbody\n` to its stdin,
/// waiting for it to exit. Used for both user hook commands and the
/// `success-cmd`/`failure-cmd` reporter options.
pub async fn run_hook(command: &str, title: &str, body: &str) {
    let result: anyhow::Result<()> = async {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(title.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.write_all(body.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        child.wait().await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        warn!("hook command failed: command={command} error={err}");
    }
}

/// Notification urgency, passed through to the desktop notification helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyCategory {
    Info,
    Error,
}

impl NotifyCategory {
    fn as_str(self) -> &'static str {
        match self {
            NotifyCategory::Info => "info",
            NotifyCategory::Error => "error",
        }
    }
}

/// Invokes a desktop notification helper binary with category,
/// application name, title and body as positional arguments. The
/// shipped default targets `notify-send`; any compatible binary works.
pub async fn notify(binary: &str, category: NotifyCategory, app_name: &str, title: &str, body: &str) {
    let result = Command::new(binary)
        .arg(category.as_str())
        .arg(app_name)
        .arg(title)
        .arg(body)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    if let Err(err) = result {
        warn!("notification helper failed: binary={binary} error={err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_hook_does_not_panic_on_missing_command() {
        run_hook("command-that-does-not-exist-xyz", "title", "body").await;
    }

    #[tokio::test]
    async fn run_hook_pipes_title_and_body_to_stdin() {
        let dir = std::env::temp_dir().join(format!("mailsweep-hook-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let out = dir.join("out.txt");
        let command = format!("cat > {}", out.display());

        run_hook(&command, "hello", "world").await;

        let contents = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(contents, "hello\nworld\n");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
