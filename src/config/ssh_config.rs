//! Lookup of host settings in the OpenSSH client configuration files.
//!
//! Only the options needed for connecting are looked at: `HostName`, `User`, `Port` and
//! `IdentityFile`. As in OpenSSH, the first obtained value wins, the per-user file is read before the
//! global one, and `Include` directives are expanded in place. `Match` blocks are skipped.

use crate::error::{Error, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use wildmatch::WildMatch;

/// Nesting limit of `Include` directives.
const MAX_INCLUDE_DEPTH: usize = 16;

const SYSTEM_CONFIG_DIR: &str = "/etc/ssh";
const SYSTEM_CONFIG: &str = "/etc/ssh/ssh_config";

/// Settings of one host found in the SSH configuration files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostParams {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// `IdentityFile` values, tokens not expanded yet.
    pub identity_files: Vec<String>,
}

impl HostParams {
    /// Returns the identity files with `~` and the `%` tokens expanded.
    pub fn identity_paths(&self, host: &str, remote_user: &str) -> Vec<PathBuf> {
        let hostname = self.hostname.as_deref().unwrap_or(host);
        self.identity_files
            .iter()
            .map(|file| expand_tilde(&expand_tokens(file, hostname, remote_user)))
            .collect()
    }
}

/// Replaces a leading `~` with the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Expands `%d` (home directory), `%u` (local user), `%r` (remote user), `%h` (remote host) and
/// `%%`. Unknown tokens are kept as they are.
fn expand_tokens(value: &str, hostname: &str, remote_user: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => result.push('%'),
            Some('d') => {
                let home = dirs::home_dir().unwrap_or_default();
                result.push_str(&home.to_string_lossy());
            }
            Some('u') => result.push_str(&whoami::username()),
            Some('r') => result.push_str(remote_user),
            Some('h') => result.push_str(hostname),
            Some(other) => {
                result.push('%');
                result.push(other);
            }
            None => result.push('%'),
        }
    }
    result
}

/// Looks up `host` in `~/.ssh/config` and then in `/etc/ssh/ssh_config`.
pub fn lookup(host: &str) -> Result<HostParams> {
    let mut files = Vec::new();
    if let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) {
        files.push((ssh_dir.join("config"), ssh_dir));
    }
    files.push((PathBuf::from(SYSTEM_CONFIG), PathBuf::from(SYSTEM_CONFIG_DIR)));
    lookup_in(host, &files)
}

/// Looks up `host` in the given configuration files. Each file comes with the directory relative
/// `Include` paths are resolved against.
pub fn lookup_in(host: &str, files: &[(PathBuf, PathBuf)]) -> Result<HostParams> {
    let mut parser = Parser {
        host: host.to_lowercase(),
        params: HostParams::default(),
    };
    for (path, base) in files {
        parser.parse_file(path, base, 0)?;
    }
    debug!("SSH configuration for '{}': {:?}", host, parser.params);
    Ok(parser.params)
}

struct Parser {
    host: String,
    params: HostParams,
}

/// Splits a line into the keyword and its arguments. Keywords may be separated by `=`.
fn split_line(line: &str) -> Option<(String, Vec<String>)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let keyword = line[..end].to_lowercase();
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    let args = shlex::split(rest).unwrap_or_else(|| vec![rest.to_string()]);
    Some((keyword, args))
}

impl Parser {
    /// Checks the patterns of a `Host` line against the host.
    fn host_matches(&self, patterns: &[String]) -> bool {
        let mut matched = false;
        for pattern in patterns {
            let pattern = pattern.to_lowercase();
            if let Some(negated) = pattern.strip_prefix('!') {
                if WildMatch::new(negated).matches(&self.host) {
                    return false;
                }
            } else if WildMatch::new(&pattern).matches(&self.host) {
                matched = true;
            }
        }
        matched
    }

    fn parse_file(&mut self, path: &Path, base: &Path, depth: usize) -> Result<()> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(Error::Config(format!(
                "too deeply nested 'Include' directives in SSH configuration file '{}'",
                path.display()
            )));
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("skipping SSH configuration file '{}': {}", path.display(), e);
                return Ok(());
            }
        };

        let mut active = true;
        for line in contents.lines() {
            let Some((keyword, args)) = split_line(line) else {
                continue;
            };

            match keyword.as_str() {
                "host" => active = self.host_matches(&args),
                "match" => active = false,
                _ if !active => {}
                "include" => {
                    for pattern in &args {
                        for include in resolve_include(pattern, base) {
                            self.parse_file(&include, base, depth + 1)?;
                        }
                    }
                }
                "hostname" => {
                    if self.params.hostname.is_none() {
                        self.params.hostname = args.into_iter().next();
                    }
                }
                "user" => {
                    if self.params.user.is_none() {
                        self.params.user = args.into_iter().next();
                    }
                }
                "port" => {
                    if self.params.port.is_none() {
                        self.params.port = args.first().and_then(|port| port.parse().ok());
                    }
                }
                "identityfile" => self.params.identity_files.extend(args),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Returns the files an `Include` pattern refers to, sorted. Wildcards are supported in the last
/// path component.
fn resolve_include(pattern: &str, base: &Path) -> Vec<PathBuf> {
    let path = expand_tilde(pattern);
    let path = if path.is_absolute() {
        path
    } else {
        base.join(path)
    };

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !name.contains(['*', '?']) {
        return vec![path];
    }

    let Some(dir) = path.parent() else {
        return Vec::new();
    };
    let matcher = WildMatch::new(&name);
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| matcher.matches(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect(),
        Err(e) => {
            debug!("cannot list '{}': {}", dir.display(), e);
            Vec::new()
        }
    };
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn lookup_one(dir: &TempDir, config: &Path, host: &str) -> HostParams {
        lookup_in(host, &[(config.to_path_buf(), dir.path().to_path_buf())]).unwrap()
    }

    #[test]
    fn test_first_value_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config",
            "Host sut\n  HostName 10.0.0.5\n  User root\n\n\
             Host *\n  User nobody\n  Port 2222\n  IdentityFile ~/.ssh/id_rsa\n",
        );

        let params = lookup_one(&dir, &config, "sut");
        assert_eq!(params.hostname.as_deref(), Some("10.0.0.5"));
        assert_eq!(params.user.as_deref(), Some("root"));
        assert_eq!(params.port, Some(2222));
        assert_eq!(params.identity_files, vec!["~/.ssh/id_rsa"]);

        let params = lookup_one(&dir, &config, "other");
        assert!(params.hostname.is_none());
        assert_eq!(params.user.as_deref(), Some("nobody"));
    }

    #[test]
    fn test_patterns_and_negation() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config",
            "Host lab-? !lab-x\n  User lab\nHost=*.example.com\n  Port=2200\n",
        );

        assert_eq!(lookup_one(&dir, &config, "lab-1").user.as_deref(), Some("lab"));
        assert_eq!(lookup_one(&dir, &config, "LAB-2").user.as_deref(), Some("lab"));
        assert!(lookup_one(&dir, &config, "lab-x").user.is_none());
        assert!(lookup_one(&dir, &config, "lab-10").user.is_none());
        assert_eq!(lookup_one(&dir, &config, "a.example.com").port, Some(2200));
    }

    #[test]
    fn test_match_blocks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config",
            "Match user root\n  User wrong\nHost *\n  User right\n",
        );
        assert_eq!(lookup_one(&dir, &config, "any").user.as_deref(), Some("right"));
    }

    #[test]
    fn test_include_relative_and_glob() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "conf.d/10-sut.conf", "Host sut\n  User first\n");
        write(&dir, "conf.d/20-sut.conf", "Host sut\n  User second\n  Port 23\n");
        write(&dir, "conf.d/ignored.txt", "Host sut\n  Port 99\n");
        write(&dir, "extra", "Host *\n  HostName included.lan\n");
        let config = write(&dir, "config", "Include conf.d/*.conf extra\n");

        let params = lookup_one(&dir, &config, "sut");
        assert_eq!(params.user.as_deref(), Some("first"));
        assert_eq!(params.port, Some(23));
        assert_eq!(params.hostname.as_deref(), Some("included.lan"));
    }

    #[test]
    fn test_include_inside_inactive_block() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "other", "User included\n");
        let config = write(&dir, "config", "Host nomatch\n  Include other\n");
        assert!(lookup_one(&dir, &config, "sut").user.is_none());
    }

    #[test]
    fn test_include_loop_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(&dir, "config", "Include config\n");
        let result = lookup_in("sut", &[(config, dir.path().to_path_buf())]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let params = lookup_one(&dir, &dir.path().join("missing"), "sut");
        assert_eq!(params, HostParams::default());
    }

    #[test]
    fn test_identity_tokens() {
        let params = HostParams {
            hostname: Some("real.lan".to_string()),
            identity_files: vec!["/keys/%r@%h-%%".to_string(), "/keys/%x".to_string()],
            ..HostParams::default()
        };
        let paths = params.identity_paths("alias", "root");
        assert_eq!(paths[0], PathBuf::from("/keys/root@real.lan-%"));
        assert_eq!(paths[1], PathBuf::from("/keys/%x"));

        let expanded = expand_tokens("%u", "h", "r");
        assert_eq!(expanded, whoami::username());
    }

    #[test]
    fn test_split_line() {
        assert_eq!(split_line("  # comment"), None);
        assert_eq!(split_line(""), None);
        assert_eq!(
            split_line("IdentityFile \"/a b/key\""),
            Some(("identityfile".to_string(), vec!["/a b/key".to_string()]))
        );
        assert_eq!(
            split_line("Port = 22"),
            Some(("port".to_string(), vec!["22".to_string()]))
        );
    }
}
