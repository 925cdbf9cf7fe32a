//! Message delivery: an external MDA subprocess, or an internal
//! Maildir writer with the bit-exact naming and fsync/lock discipline
//! required for cross-implementation interoperability.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// One message handed to a Delivery implementation.
pub struct Message {
    pub uid: String,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

/// The all-or-nothing result of delivering a batch: every UID appears
/// in exactly one of the two lists.
#[derive(Debug, Default)]
pub struct DeliveryOutcome {
    pub delivered: Vec<String>,
    pub undelivered: Vec<String>,
}

#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver_batch(&self, messages: &[Message]) -> DeliveryOutcome;
}

/// Spawns `sh -c <command>` once per message, streaming header then
/// body to its stdin. Success requires both a clean flush and a zero
/// exit status.
pub struct ExternalMda {
    pub command: String,
}

#[async_trait::async_trait]
impl Delivery for ExternalMda {
    async fn deliver_batch(&self, messages: &[Message]) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();
        for message in messages {
            match self.deliver_one(message).await {
                Ok(()) => outcome.delivered.push(message.uid.clone()),
                Err(err) => {
                    warn!("mda delivery failed: uid={} error={err}", message.uid);
                    outcome.undelivered.push(message.uid.clone());
                }
            }
        }
        outcome
    }
}

impl ExternalMda {
    async fn deliver_one(&self, message: &Message) -> anyhow::Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("mda stdin not captured"))?;
        stdin.write_all(&message.header).await?;
        stdin.write_all(&message.body).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("mda exited with status {status}");
        }
        Ok(())
    }
}

/// Writes each message into a Maildir at `root`, following the
/// tmp-write -> fsync-batch -> locked-rename -> dir-fsync sequence.
pub struct MaildirDelivery {
    pub root: PathBuf,
}

struct WrittenTemp {
    uid: String,
    tmp_path: PathBuf,
    hash: String,
    size: usize,
}

/// Per-UID outcome of a locked rename pass. A UID lands in `failed`
/// only when its own `rename(2)` failed; every other attempted UID
/// that succeeded stays in `delivered` even if later UIDs in the same
/// batch fail. The whole batch is undelivered only when the caller
/// gets an `Err` back from `rename_under_lock` (the directory fsync
/// failed), never from an individual rename failure.
#[derive(Debug, Default)]
struct RenameOutcome {
    delivered: Vec<String>,
    failed: Vec<String>,
}

#[async_trait::async_trait]
impl Delivery for MaildirDelivery {
    async fn deliver_batch(&self, messages: &[Message]) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();

        if let Err(err) = self.ensure_subdirs().await {
            warn!("maildir setup failed: root={} error={err}", self.root.display());
            outcome.undelivered.extend(messages.iter().map(|m| m.uid.clone()));
            return outcome;
        }

        let mut written = Vec::new();
        for message in messages {
            match self.write_temp(message).await {
                Ok(temp) => written.push(temp),
                Err(err) => {
                    warn!("maildir tmp write failed: uid={} error={err}", message.uid);
                    outcome.undelivered.push(message.uid.clone());
                }
            }
        }

        match self.rename_batch(&written).await {
            Ok(rename_outcome) => {
                let failed: std::collections::HashSet<&str> =
                    rename_outcome.failed.iter().map(String::as_str).collect();
                for temp in &written {
                    if failed.contains(temp.uid.as_str()) {
                        let _ = tokio::fs::remove_file(&temp.tmp_path).await;
                    }
                }
                outcome.delivered.extend(rename_outcome.delivered);
                outcome.undelivered.extend(rename_outcome.failed);
            }
            Err(err) => {
                warn!("maildir rename batch fsync failed: root={} error={err}", self.root.display());
                for temp in &written {
                    let _ = tokio::fs::remove_file(&temp.tmp_path).await;
                }
                outcome.undelivered.extend(written.into_iter().map(|t| t.uid));
            }
        }

        outcome
    }
}

impl MaildirDelivery {
    async fn ensure_subdirs(&self) -> std::io::Result<()> {
        for sub in ["tmp", "new", "cur"] {
            tokio::fs::create_dir_all(self.root.join(sub)).await?;
        }
        Ok(())
    }

    async fn write_temp(&self, message: &Message) -> std::io::Result<WrittenTemp> {
        let mut hasher = Sha256::new();
        hasher.update(&message.header);
        hasher.update(&message.body);
        let hash = hex_lower(&hasher.finalize());
        let size = message.header.len() + message.body.len();

        let tmp_dir = self.root.join("tmp");
        let pid = std::process::id();
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let host = hostname();

        let mut n = 0u64;
        loop {
            let name = format!("IAP_{pid}_{epoch_ms}_{n}.{host},S={size}.part");
            let path = tmp_dir.join(&name);
            let mut opts = tokio::fs::OpenOptions::new();
            opts.write(true).create_new(true);
            match opts.open(&path).await {
                Ok(mut file) => {
                    file.write_all(&message.header).await?;
                    file.write_all(&message.body).await?;
                    file.flush().await?;
                    file.sync_all().await?;
                    return Ok(WrittenTemp { uid: message.uid.clone(), tmp_path: path, hash, size });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    n += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn rename_batch(&self, written: &[WrittenTemp]) -> std::io::Result<RenameOutcome> {
        if written.is_empty() {
            return Ok(RenameOutcome::default());
        }

        let new_dir = self.root.join("new");
        let lock_dir = new_dir.clone();
        let host = hostname();
        let plan: Vec<(String, PathBuf, PathBuf)> = written
            .iter()
            .map(|t| (t.uid.clone(), t.tmp_path.clone(), pick_final_name(&new_dir, &t.hash, &host, t.size)))
            .collect();

        tokio::task::spawn_blocking(move || rename_under_lock(&lock_dir, &plan))
            .await
            .map_err(|err| std::io::Error::other(err.to_string()))?
    }
}

/// Picks the smallest disambiguator `m >= 0` such that the target name
/// does not already exist.
fn pick_final_name(new_dir: &Path, hash: &str, host: &str, size: usize) -> PathBuf {
    let mut m = 0u64;
    loop {
        let name = format!("IAH_{hash}_{m}.{host},S={size}");
        let path = new_dir.join(&name);
        if !path.exists() {
            return path;
        }
        m += 1;
    }
}

/// Renames every `(uid, tmp, final)` triple under an exclusive
/// advisory lock on the `new/` directory, then fsyncs the directory.
/// Runs on a blocking thread because `flock(2)` has no async
/// equivalent.
///
/// Each rename is attempted independently: one UID's rename failing
/// (e.g. a collision outside `pick_final_name`'s own check, or a
/// transient ENOSPC) does not stop the rest of the batch, and a UID
/// that did rename successfully is never walked back into `failed`.
/// The `Err` path here is reserved for the directory fsync itself
/// failing, which the caller treats as voiding the whole batch
/// regardless of which individual renames already landed.
fn rename_under_lock(dir: &Path, plan: &[(String, PathBuf, PathBuf)]) -> std::io::Result<RenameOutcome> {
    let dir_file = std::fs::File::open(dir)?;
    let fd = dir_file.as_raw_fd();

    // SAFETY: `fd` stays valid for the call because `dir_file` is held
    // alive for the whole function body.
    let locked = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if locked != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut outcome = RenameOutcome::default();
    for (uid, tmp, dest) in plan {
        match std::fs::rename(tmp, dest) {
            Ok(()) => outcome.delivered.push(uid.clone()),
            Err(err) => {
                warn!("maildir rename failed: uid={uid} error={err}");
                outcome.failed.push(uid.clone());
            }
        }
    }
    let synced = dir_file.sync_all();

    // SAFETY: same `fd`, released unconditionally before returning.
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }

    synced?;
    Ok(outcome)
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mailsweep-maildir-test-{tag}-{}", std::process::id()))
    }

    fn msg(uid: &str, header: &[u8], body: &[u8]) -> Message {
        Message { uid: uid.to_string(), header: header.to_vec(), body: body.to_vec() }
    }

    #[tokio::test]
    async fn delivers_each_message_to_exactly_one_file() {
        let root = scratch_dir("basic");
        let delivery = MaildirDelivery { root: root.clone() };

        let messages =
            vec![msg("1", b"Subject: a\r\n\r\n", b"body one"), msg("2", b"Subject: b\r\n\r\n", b"body two")];
        let outcome = delivery.deliver_batch(&messages).await;

        assert_eq!(outcome.undelivered.len(), 0);
        assert_eq!(outcome.delivered.len(), 2);

        let mut entries = tokio::fs::read_dir(root.join("new")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn identical_messages_get_distinct_disambiguators() {
        let root = scratch_dir("dup");
        let delivery = MaildirDelivery { root: root.clone() };

        let messages = vec![msg("1", b"Subject: x\r\n\r\n", b"same body"), msg("2", b"Subject: x\r\n\r\n", b"same body")];
        let outcome = delivery.deliver_batch(&messages).await;
        assert_eq!(outcome.delivered.len(), 2);

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(root.join("new")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        assert_eq!(names.len(), 2);
        let prefix_a = names[0].split('_').take(2).collect::<Vec<_>>().join("_");
        let prefix_b = names[1].split('_').take(2).collect::<Vec<_>>().join("_");
        assert_eq!(prefix_a, prefix_b);
        assert_ne!(names[0], names[1]);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn one_failed_rename_does_not_undeliver_its_batch_mates() {
        let root = scratch_dir("partial-fail");
        tokio::fs::create_dir_all(root.join("new")).await.unwrap();
        tokio::fs::create_dir_all(root.join("tmp")).await.unwrap();

        let ok_tmp = root.join("tmp").join("ok.part");
        tokio::fs::write(&ok_tmp, b"ok").await.unwrap();
        // No file written at `missing_tmp`: its rename will fail with
        // ENOENT while the other UID's rename still succeeds.
        let missing_tmp = root.join("tmp").join("missing.part");

        let new_dir = root.join("new");
        let plan = vec![
            ("1".to_string(), ok_tmp.clone(), new_dir.join("delivered-1")),
            ("2".to_string(), missing_tmp, new_dir.join("delivered-2")),
        ];

        let outcome = tokio::task::spawn_blocking({
            let dir = new_dir.clone();
            move || rename_under_lock(&dir, &plan)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome.delivered, vec!["1".to_string()]);
        assert_eq!(outcome.failed, vec!["2".to_string()]);
        assert!(new_dir.join("delivered-1").exists());
        assert!(!new_dir.join("delivered-2").exists());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
