use std::io;
use std::path::Path;

use backhaul_proto::Identity;

use crate::server::Server;

/// Loads a properties-style allow-list (`host=identifier` per line) into the
/// registry's pre-enrollment map. Returns how many entries were applied.
///
/// Lines that fail to parse are logged and skipped so one typo does not take
/// every other client down with it.
pub fn load_allow_list(server: &Server, path: &Path) -> io::Result<usize> {
    if path.is_dir() {
        let mut applied = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() {
                tracing::debug!("skipping directory {}", entry.path().display());
                continue;
            }
            applied += load_file(server, &entry.path())?;
        }
        return Ok(applied);
    }
    load_file(server, path)
}

fn load_file(server: &Server, path: &Path) -> io::Result<usize> {
    let contents = std::fs::read_to_string(path)?;
    let mut applied = 0;
    for (lineno, line) in contents.lines().enumerate() {
        match parse_line(line) {
            Ok(Some((host, identity))) => {
                server.register_tunnel(&host, identity);
                applied += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "ignoring {}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e
                );
            }
        }
    }
    tracing::info!("loaded {} allow-list entries from {}", applied, path.display());
    Ok(applied)
}

fn parse_line(line: &str) -> Result<Option<(String, Identity)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return Ok(None);
    }
    let (host, identity) = line
        .split_once('=')
        .ok_or_else(|| format!("expected host=identifier, got {line:?}"))?;
    let host = host.trim();
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    let identity: Identity = identity
        .trim()
        .parse()
        .map_err(|e| format!("bad identifier for {host:?}: {e}"))?;
    Ok(Some((host.to_string(), identity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_skips_noise() {
        let id = Identity::from_bytes([9u8; 32]);
        let line = format!("foo.example = {id}");
        let (host, parsed) = parse_line(&line).unwrap().unwrap();
        assert_eq!(host, "foo.example");
        assert_eq!(parsed, id);

        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("# comment"), Ok(None));
        assert_eq!(parse_line("! comment"), Ok(None));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("no-separator").is_err());
        assert!(parse_line("=ABCDEF").is_err());
        assert!(parse_line("host=not-an-identifier").is_err());
    }
}
