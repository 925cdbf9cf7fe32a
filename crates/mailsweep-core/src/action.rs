//! The per-folder action dispatcher: count, mark, fetch and delete,
//! including batching, STORE application and the cross-action barrier.

use std::collections::BTreeMap;

use mailsweep_proto::Node;

use crate::account::{Account, CycleState, DeliveryMode, FetchSpec, Marking, Method};
use crate::connection::Connection;
use crate::delivery::{Delivery, Message};
use crate::error::{ConnectionError, Failure};
use crate::filter::FilterSpec;
use crate::folder;

/// UIDs per STORE command; an internal packing detail, not a user knob.
const STORE_BATCH: usize = 200;

pub async fn count(conn: &mut Connection, filter: &str) -> Result<usize, Failure> {
    let uids = folder::uid_search(conn, filter).await.map_err(account_failure)?;
    Ok(uids.len())
}

pub async fn mark(
    conn: &mut Connection,
    account: &mut Account,
    filter: &str,
    marking: Marking,
) -> Result<(), Failure> {
    let Some((op, flag)) = marking_store_args(marking) else {
        return Ok(());
    };

    let uids = folder::uid_search(conn, filter).await.map_err(account_failure)?;
    for chunk in uids.chunks(STORE_BATCH) {
        let csv = mailsweep_proto::command::join_uids(chunk);
        let args = format!("{csv} {op}FLAGS.SILENT {flag}");
        let resp = conn.command("UID STORE", &args).await.map_err(folder_failure)?;
        if resp.is_ok() {
            account.telemetry.marked += chunk.len() as u64;
        } else {
            account.record_error(format!("STORE failed for {} uids: {}", chunk.len(), resp.text));
        }
    }
    Ok(())
}

pub async fn fetch(
    conn: &mut Connection,
    account: &mut Account,
    folder_name: &str,
    filter: &FilterSpec,
    rendered_filter: &str,
    spec: &FetchSpec,
    cycle: &mut CycleState,
) -> Result<(), Failure> {
    let delivery = spec.delivery.as_ref();
    let uids = folder::uid_search(conn, rendered_filter).await.map_err(account_failure)?;
    if uids.is_empty() {
        return Ok(());
    }

    let (sized, conflicts) = probe_sizes(conn, &uids, spec.fetch_number).await?;
    for notice in conflicts {
        account.record_error(notice);
    }

    let batches = pack_batches(sized, spec.batch_number, spec.batch_size);
    let marking = spec.marking.resolve(filter);
    let mut any_delivered = false;

    for batch_uids in batches {
        let messages = retrieve_bodies(conn, &batch_uids).await?;
        let outcome = delivery.deliver_batch(&messages).await;

        account.telemetry.delivered += outcome.delivered.len() as u64;
        account.telemetry.undelivered += outcome.undelivered.len() as u64;

        match spec.delivery_mode {
            DeliveryMode::Yolo => {}
            DeliveryMode::Careful => {
                if outcome.delivered.is_empty() && !messages.is_empty() {
                    account.record_error(format!(
                        "fetch: zero of {} messages delivered in folder {folder_name}",
                        messages.len()
                    ));
                    return Err(Failure::AccountSoft(format!(
                        "careful-mode fetch aborted: zero deliveries in folder {folder_name}"
                    )));
                }
            }
            DeliveryMode::Paranoid => {
                if !outcome.undelivered.is_empty() {
                    return Err(Failure::Catastrophic(format!(
                        "paranoid-mode fetch lost {} messages in folder {folder_name}",
                        outcome.undelivered.len()
                    )));
                }
            }
        }

        if !outcome.delivered.is_empty() {
            any_delivered = true;
            // Non-interruptible: the conditional STORE after a
            // successful fetch batch runs to completion regardless of
            // a pending shutdown request, so already-delivered
            // messages are never re-downloaded next cycle.
            if let Some((op, flag)) = marking_store_args(marking) {
                let csv = mailsweep_proto::command::join_uids(&outcome.delivered);
                let args = format!("{csv} {op}FLAGS.SILENT {flag}");
                let resp = conn.command("UID STORE", &args).await.map_err(folder_failure)?;
                if resp.is_ok() {
                    account.telemetry.marked += outcome.delivered.len() as u64;
                } else {
                    account.record_error(format!("post-fetch STORE failed: {}", resp.text));
                }
            }
        }
    }

    if any_delivered {
        for hook in &spec.new_mail_hooks {
            cycle.enqueue_hook(hook.clone());
        }
    }

    Ok(())
}

pub async fn delete(
    conn: &mut Connection,
    account: &mut Account,
    folder_name: &str,
    filter: &str,
    method: Method,
) -> Result<(), Failure> {
    if account.has_errors() {
        account.record_error(format!(
            "delete skipped in folder {folder_name}: an earlier sub-action already recorded an error"
        ));
        return Ok(());
    }

    let uids = folder::uid_search(conn, filter).await.map_err(account_failure)?;
    if uids.is_empty() {
        return Ok(());
    }

    let resolved = method.resolve(account, folder_name);

    for chunk in uids.chunks(STORE_BATCH) {
        let csv = mailsweep_proto::command::join_uids(chunk);
        let args = match resolved {
            Method::GmailTrash => format!("{csv} +X-GM-LABELS \\Trash"),
            Method::Delete | Method::DeleteNoExpunge => format!("{csv} +FLAGS.SILENT \\Deleted"),
            Method::Auto => unreachable!("resolve() never returns Auto"),
        };

        let resp = conn.command("UID STORE", &args).await.map_err(folder_failure)?;
        if !resp.is_ok() {
            account.record_error(format!("delete STORE failed: {}", resp.text));
            continue;
        }

        match resolved {
            Method::GmailTrash => account.telemetry.trashed += chunk.len() as u64,
            Method::Delete | Method::DeleteNoExpunge => account.telemetry.deleted += chunk.len() as u64,
            Method::Auto => {}
        }
    }

    if resolved == Method::Delete {
        let resp = conn.command("EXPUNGE", "").await.map_err(folder_failure)?;
        if !resp.is_ok() {
            account.record_error(format!("EXPUNGE failed: {}", resp.text));
        }
    }

    Ok(())
}

fn marking_store_args(marking: Marking) -> Option<(&'static str, &'static str)> {
    match marking {
        Marking::Seen => Some(("+", "\\Seen")),
        Marking::Unseen => Some(("-", "\\Seen")),
        Marking::Flagged => Some(("+", "\\Flagged")),
        Marking::Unflagged => Some(("-", "\\Flagged")),
        Marking::Noop | Marking::Auto => None,
    }
}

async fn probe_sizes(
    conn: &mut Connection,
    uids: &[String],
    fetch_number: usize,
) -> Result<(Vec<(String, u64)>, Vec<String>), Failure> {
    let mut sized = Vec::new();
    let mut conflicts = Vec::new();

    for group in uids.chunks(fetch_number.max(1)) {
        let csv = mailsweep_proto::command::join_uids(group);
        let args = format!("{csv} (RFC822.SIZE)");
        let resp = conn.command("UID FETCH", &args).await.map_err(folder_failure)?;
        if !resp.is_ok() {
            return Err(Failure::Folder(format!("UID FETCH (RFC822.SIZE) failed: {}", resp.text)));
        }

        for nodes in resp.parsed_lines().map_err(folder_failure)? {
            match fetch_attrs(&nodes).and_then(|attrs| size_pair(&attrs)) {
                Some(pair) => sized.push(pair),
                None => conflicts.push(
                    "untagged FETCH without a matching UID/RFC822.SIZE pair: treating as a \
                     concurrent mutation signal from another client"
                        .to_string(),
                ),
            }
        }
    }

    let probed: std::collections::HashSet<&str> = sized.iter().map(|(uid, _)| uid.as_str()).collect();
    for uid in uids {
        if !probed.contains(uid.as_str()) {
            conflicts.push(format!(
                "UID {uid} was searched but never appeared in the RFC822.SIZE probe response: \
                 treating as a concurrent mutation signal from another client"
            ));
        }
    }

    Ok((sized, conflicts))
}

fn size_pair(attrs: &BTreeMap<Vec<u8>, Node>) -> Option<(String, u64)> {
    let uid = attrs.get(b"UID".as_slice())?.as_atom()?;
    let size = attrs.get(b"RFC822.SIZE".as_slice())?.as_atom()?;
    let uid = String::from_utf8_lossy(uid).to_string();
    let size = std::str::from_utf8(size).ok()?.parse().ok()?;
    Some((uid, size))
}

fn fetch_attrs(nodes: &[Node]) -> Option<BTreeMap<Vec<u8>, Node>> {
    let list = nodes.get(3)?.as_list()?;
    mailsweep_proto::parse_attrs(list.to_vec()).ok()
}

/// Greedily packs `(uid, size)` pairs into batches bounded by count and
/// running size: repeatedly partitions the unplaced pairs into "fits"
/// and "leftover"; an empty result forces the first leftover in alone.
fn pack_batches(pairs: Vec<(String, u64)>, batch_number: usize, batch_size: u64) -> Vec<Vec<String>> {
    let mut unplaced = pairs;
    let mut batches = Vec::new();

    while !unplaced.is_empty() {
        let mut batch = Vec::new();
        let mut leftover = Vec::new();
        let mut running_size = 0u64;

        for (uid, size) in unplaced {
            if batch.len() < batch_number && running_size + size < batch_size {
                running_size += size;
                batch.push((uid, size));
            } else {
                leftover.push((uid, size));
            }
        }

        if batch.is_empty() && !leftover.is_empty() {
            batch.push(leftover.remove(0));
        }

        batches.push(batch.into_iter().map(|(uid, _)| uid).collect());
        unplaced = leftover;
    }

    batches
}

async fn retrieve_bodies(conn: &mut Connection, uids: &[String]) -> Result<Vec<Message>, Failure> {
    let csv = mailsweep_proto::command::join_uids(uids);
    let args = format!("{csv} (BODY.PEEK[HEADER] BODY.PEEK[TEXT])");
    let resp = conn.command("UID FETCH", &args).await.map_err(folder_failure)?;
    if !resp.is_ok() {
        return Err(Failure::Folder(format!("UID FETCH body failed: {}", resp.text)));
    }

    let mut messages = Vec::new();
    for nodes in resp.parsed_lines().map_err(folder_failure)? {
        let Some(attrs) = fetch_attrs(&nodes) else { continue };
        let uid = attrs.get(b"UID".as_slice()).and_then(Node::as_atom);
        let header =
            attrs.iter().find(|(k, _)| k.starts_with(b"BODY[HEADER")).and_then(|(_, v)| v.as_atom());
        let body = attrs.iter().find(|(k, _)| k.starts_with(b"BODY[TEXT")).and_then(|(_, v)| v.as_atom());

        if let (Some(uid), Some(header), Some(body)) = (uid, header, body) {
            messages.push(Message {
                uid: String::from_utf8_lossy(uid).to_string(),
                header: normalize_line_endings(header),
                body: normalize_line_endings(body),
            });
        }
    }
    Ok(messages)
}

/// Replaces CRLF with LF, matching mutt/fetchmail delivery conventions.
fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn account_failure(err: ConnectionError) -> Failure {
    Failure::Account(err.to_string())
}

fn folder_failure(err: ConnectionError) -> Failure {
    Failure::Folder(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(uid: &str, kib: u64) -> (String, u64) {
        (uid.to_string(), kib * 1024)
    }

    #[test]
    fn batch_packing_splits_three_messages_as_in_the_reference_scenario() {
        let pairs = vec![pair("1", 100), pair("2", 200), pair("3", 300)];
        let batches = pack_batches(pairs, 10, 256 * 1024);
        assert_eq!(batches, vec![vec!["1".to_string()], vec!["2".to_string()], vec!["3".to_string()]]);
    }

    #[test]
    fn batch_packing_gives_an_oversize_message_its_own_batch() {
        let pairs = vec![pair("1", 500)];
        let batches = pack_batches(pairs, 10, 64 * 1024);
        assert_eq!(batches, vec![vec!["1".to_string()]]);
    }

    #[test]
    fn batch_packing_respects_batch_number_even_when_size_allows_more() {
        let pairs = vec![pair("1", 1), pair("2", 1), pair("3", 1)];
        let batches = pack_batches(pairs, 2, 1024 * 1024);
        assert_eq!(batches, vec![vec!["1".to_string(), "2".to_string()], vec!["3".to_string()]]);
    }

    #[test]
    fn normalize_line_endings_converts_crlf_only() {
        assert_eq!(normalize_line_endings(b"a\r\nb\nc\r\n"), b"a\nb\nc\n");
    }

    #[test]
    fn marking_noop_and_auto_perform_no_store() {
        assert_eq!(marking_store_args(Marking::Noop), None);
        assert_eq!(marking_store_args(Marking::Auto), None);
        assert_eq!(marking_store_args(Marking::Seen), Some(("+", "\\Seen")));
        assert_eq!(marking_store_args(Marking::Unflagged), Some(("-", "\\Flagged")));
    }
}
