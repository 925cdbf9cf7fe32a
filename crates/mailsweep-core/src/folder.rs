//! Folder listing, selection and cleanup.

use mailsweep_proto::Node;

use crate::connection::Connection;
use crate::error::ConnectionError;

/// Lists selectable folder names (excludes entries tagged `\Noselect`).
pub async fn list_folders(conn: &mut Connection) -> Result<Vec<String>, ConnectionError> {
    let resp = conn.command("LIST", "\"\" \"*\"").await?;
    if !resp.is_ok() {
        return Err(ConnectionError::CommandFailure { tag: "list".to_string(), text: resp.text });
    }

    let mut folders = Vec::new();
    for nodes in resp.parsed_lines()? {
        // "* LIST (attrs...) "delim" "name""
        let attrs = nodes.get(2).and_then(Node::as_list).unwrap_or(&[]);
        let is_noselect = attrs.iter().any(|node| {
            node.as_atom().map(|a| a.eq_ignore_ascii_case(b"\\Noselect")).unwrap_or(false)
        });
        if is_noselect {
            continue;
        }
        if let Some(name) = nodes.get(4).and_then(Node::as_atom) {
            folders.push(String::from_utf8_lossy(name).to_string());
        }
    }
    Ok(folders)
}

/// Selects `folder`. A non-OK result is a folder-scoped failure, not a
/// connection-fatal one; the caller decides whether to skip the folder.
pub async fn select(conn: &mut Connection, folder: &str) -> Result<(), ConnectionError> {
    let args = mailsweep_proto::command::quote(folder);
    let resp = conn.command("SELECT", &args).await?;
    if resp.is_ok() {
        Ok(())
    } else {
        Err(ConnectionError::CommandFailure { tag: "select".to_string(), text: resp.text })
    }
}

/// Closes the currently selected folder. Called after every folder
/// visit, including after errors, so no folder stays selected across
/// actions that target different folders.
pub async fn close(conn: &mut Connection) -> Result<(), ConnectionError> {
    let resp = conn.command("CLOSE", "").await?;
    if resp.is_ok() {
        Ok(())
    } else {
        Err(ConnectionError::CommandFailure { tag: "close".to_string(), text: resp.text })
    }
}

/// Runs `UID SEARCH <filter>` and returns the matched UIDs in server
/// order (order is not semantically significant, see `Message UID`).
pub async fn uid_search(conn: &mut Connection, filter: &str) -> Result<Vec<String>, ConnectionError> {
    let resp = conn.command("UID SEARCH", filter).await?;
    if !resp.is_ok() {
        return Err(ConnectionError::CommandFailure { tag: "uid-search".to_string(), text: resp.text });
    }

    let mut uids = Vec::new();
    for nodes in resp.parsed_lines()? {
        // "* SEARCH 1 2 3"
        for node in nodes.iter().skip(2) {
            if let Some(atom) = node.as_atom() {
                uids.push(String::from_utf8_lossy(atom).to_string());
            }
        }
    }
    Ok(uids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noselect_detection_is_case_insensitive() {
        let list = [Node::Atom(b"\\NOSELECT".to_vec())];
        assert!(list.iter().any(|n| n.as_atom().map(|a| a.eq_ignore_ascii_case(b"\\Noselect")).unwrap_or(false)));
    }
}
