//! Gateway manager: owns the per-service site blocks inside the shared
//! Caddyfile and drives gateway validation/reload.
//!
//! Each service contributes exactly one top-level block whose opener
//! (`<subdomain>.<domain> {`) sits on its own line at column 0. Blocks
//! contain nested `{ ... }` groups (`request_body`, `reverse_proxy`,
//! `transport`), so block extents are found by balanced-brace scanning —
//! a `\{[^}]*\}` regex would stop at the first nested closer.
//!
//! All edits and reload signals serialize under one process-wide lock; the
//! file itself is replaced atomically so readers never see a torn config.

use regex::Regex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::exec::{supervisor_error, CommandRunner};
use crate::fsutil;

fn proxy_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"reverse_proxy 127\.0\.0\.1:(\d+)").expect("static regex"))
}

/// Locate the top-level block for `host`, returning the byte range covering
/// the opener line through the matching closing brace's line (newline
/// included when present).
fn find_block(content: &str, host: &str) -> Option<Range<usize>> {
    for (line_start, line) in line_offsets(content) {
        let trimmed = line.trim_end();
        if !trimmed.ends_with('{') {
            continue;
        }
        // Opener must start at column 0 (not indented).
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        let opener_host = trimmed[..trimmed.len() - 1].trim();
        if opener_host != host {
            continue;
        }

        let brace_offset = line_start + line.rfind('{').expect("checked above");
        let end = match scan_balanced(content, brace_offset) {
            Some(end) => end,
            None => continue, // unterminated block; leave it alone
        };

        // Extend through the end of the closing brace's line.
        let end = content[end..]
            .find('\n')
            .map(|n| end + n + 1)
            .unwrap_or(content.len());
        return Some(line_start..end);
    }
    None
}

/// All top-level blocks as `(host, range)` pairs, in file order.
fn top_level_blocks(content: &str) -> Vec<(String, Range<usize>)> {
    let mut blocks = Vec::new();
    let mut cursor = 0usize;

    while cursor < content.len() {
        let rest = &content[cursor..];
        let (line, line_len) = match rest.find('\n') {
            Some(n) => (&rest[..n], n + 1),
            None => (rest, rest.len()),
        };

        let trimmed = line.trim_end();
        if !line.starts_with(char::is_whitespace) && trimmed.ends_with('{') && trimmed.len() > 1 {
            let host = trimmed[..trimmed.len() - 1].trim().to_string();
            let brace_offset = cursor + line.rfind('{').expect("checked above");
            if let Some(end) = scan_balanced(content, brace_offset) {
                let end = content[end..]
                    .find('\n')
                    .map(|n| end + n + 1)
                    .unwrap_or(content.len());
                blocks.push((host, cursor..end));
                cursor = end;
                continue;
            }
        }

        cursor += line_len.max(1);
    }

    blocks
}

/// Byte offset one past the brace that balances the `{` at `open`.
fn scan_balanced(content: &str, open: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    debug_assert_eq!(bytes[open], b'{');

    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn line_offsets(content: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0usize;
    content.split_inclusive('\n').map(move |line| {
        let start = offset;
        offset += line.len();
        (start, line.strip_suffix('\n').unwrap_or(line))
    })
}

pub struct CaddyManager {
    config_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    // The Caddyfile is shared across every service; edits serialize.
    edit_lock: Mutex<()>,
}

impl CaddyManager {
    pub fn new(config_path: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config_path,
            runner,
            edit_lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Render the site block for one service.
    pub fn render_block(&self, subdomain: &str, domain: &str, port: u16) -> String {
        format!(
            r#"{subdomain}.{domain} {{
    request_body {{
        max_size 10MB
    }}
    reverse_proxy 127.0.0.1:{port} {{
        transport http {{
            read_timeout 360s
        }}
        header_up X-Forwarded-For {{remote_host}}
        header_up X-Real-IP {{remote_host}}
    }}
}}
"#
        )
    }

    /// Insert or replace the block for `<subdomain>.<domain>`. An existing
    /// block is replaced in place; a new one is appended after a blank
    /// line. Returns the block content for digesting.
    pub async fn add_or_replace(&self, subdomain: &str, domain: &str, port: u16) -> Result<String> {
        let _guard = self.edit_lock.lock().await;

        let host = format!("{}.{}", subdomain, domain);
        let block = self.render_block(subdomain, domain, port);
        let content = self.read_or_init()?;

        let updated = match find_block(&content, &host) {
            Some(range) => {
                let mut updated = String::with_capacity(content.len() + block.len());
                updated.push_str(&content[..range.start]);
                updated.push_str(&block);
                updated.push_str(&content[range.end..]);
                updated
            }
            None => {
                let mut updated = content;
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                if !updated.is_empty() {
                    updated.push('\n');
                }
                updated.push_str(&block);
                updated
            }
        };

        fsutil::write_atomic(&self.config_path, &updated, 0o644)?;
        Ok(block)
    }

    /// Delete the single block for `<subdomain>.<domain>`, leaving all
    /// surrounding content byte-identical. Missing block is a no-op.
    pub async fn remove(&self, subdomain: &str, domain: &str) -> Result<()> {
        let _guard = self.edit_lock.lock().await;

        let host = format!("{}.{}", subdomain, domain);
        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let Some(range) = find_block(&content, &host) else {
            return Ok(());
        };

        // Consume one preceding blank line so repeated add/remove cycles
        // don't accumulate empty lines.
        let mut start = range.start;
        if content[..start].ends_with("\n\n") {
            start -= 1;
        }

        let mut updated = String::with_capacity(content.len());
        updated.push_str(&content[..start]);
        updated.push_str(&content[range.end..]);

        fsutil::write_atomic(&self.config_path, &updated, 0o644)?;
        Ok(())
    }

    /// True iff any block for `<subdomain>.<domain>` exists, whatever port
    /// it routes to.
    pub fn has_block(&self, subdomain: &str, domain: &str) -> Result<bool> {
        let host = format!("{}.{}", subdomain, domain);
        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(find_block(&content, &host).is_some())
    }

    /// True iff a block for `<subdomain>.<domain>` routes to `port`.
    pub fn matches(&self, subdomain: &str, domain: &str, port: u16) -> Result<bool> {
        let host = format!("{}.{}", subdomain, domain);
        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        Ok(match find_block(&content, &host) {
            Some(range) => proxy_port_re()
                .captures(&content[range])
                .and_then(|c| c[1].parse::<u16>().ok())
                == Some(port),
            None => false,
        })
    }

    /// Subdomain of the block whose reverse-proxy target is `port`, if any.
    pub fn read_subdomain_for_port(&self, port: u16) -> Result<Option<String>> {
        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for (host, range) in top_level_blocks(&content) {
            let block_port = proxy_port_re()
                .captures(&content[range])
                .and_then(|c| c[1].parse::<u16>().ok());
            if block_port == Some(port) {
                let subdomain = host.split('.').next().unwrap_or(&host).to_string();
                return Ok(Some(subdomain));
            }
        }
        Ok(None)
    }

    /// Validate the config file, then signal the gateway unit to reload.
    pub async fn reload(&self) -> Result<()> {
        let path = self.config_path.to_string_lossy().into_owned();
        let validate_args = ["validate", "--config", path.as_str()];
        let out = self.runner.run("caddy", &validate_args).await?;
        if !out.success() {
            return Err(Error::GatewayValidation {
                output: if out.stderr.trim().is_empty() {
                    out.stdout.trim().to_string()
                } else {
                    out.stderr.trim().to_string()
                },
            });
        }

        let reload_args = ["reload", "caddy"];
        let out = self.runner.run("systemctl", &reload_args).await?;
        if !out.success() {
            return Err(supervisor_error("systemctl", &reload_args, &out));
        }
        Ok(())
    }

    /// Snapshot the config next to itself before a destructive edit.
    pub async fn backup(&self) -> Result<PathBuf> {
        let _guard = self.edit_lock.lock().await;
        let backup_path = self.config_path.with_extension("bak");
        std::fs::copy(&self.config_path, &backup_path)?;
        Ok(backup_path)
    }

    /// Restore a snapshot taken by [`backup`](Self::backup).
    pub async fn restore(&self, backup_path: &Path) -> Result<()> {
        let _guard = self.edit_lock.lock().await;
        let content = std::fs::read_to_string(backup_path)?;
        fsutil::write_atomic(&self.config_path, &content, 0o644)
    }

    fn read_or_init(&self) -> Result<String> {
        match std::fs::read_to_string(&self.config_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(dir) = self.config_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                fsutil::write_atomic(&self.config_path, "", 0o644)?;
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
