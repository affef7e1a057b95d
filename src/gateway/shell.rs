//! Quoting and validation for anything interpolated into a remote command.
//! Database names, usernames and bucket names arrive from operators and
//! connection URLs; nothing reaches a shell or SQL string without passing
//! through here first.

use crate::error::{KeeperError, KeeperResult};

/// POSIX single-quote escaping: `it's` -> `'it'\''s'`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// PostgreSQL identifier: `[A-Za-z_][A-Za-z0-9_]{0,62}`.
pub fn validate_identifier(kind: &str, name: &str) -> KeeperResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!(
            "invalid {kind} {name:?}: expected letters, digits or underscores (max 63, not starting with a digit)"
        )))
    }
}

/// S3 bucket naming rules (lowercase, digits, dots, hyphens; 3..=63).
pub fn validate_bucket(name: &str) -> KeeperResult<()> {
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let valid = (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|&b| edge_ok(b) || b == b'.' || b == b'-')
        && bytes.first().copied().is_some_and(edge_ok)
        && bytes.last().copied().is_some_and(edge_ok)
        && !name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!("invalid bucket name {name:?}")))
    }
}

/// Hostname, IPv4 or bracket-free IPv6 literal.
pub fn validate_hostname(name: &str) -> KeeperResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'));
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!("invalid host name {name:?}")))
    }
}

/// Operator-chosen label that also ends up as a repository path segment:
/// `[A-Za-z0-9][A-Za-z0-9._-]{0,62}`, never `..`.
pub fn validate_label(kind: &str, name: &str) -> KeeperResult<()> {
    let valid = name.len() <= 63
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        && !name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!(
            "invalid {kind} {name:?}: expected letters, digits, '.', '-' or '_' (max 63)"
        )))
    }
}

/// S3 region: letters, digits, hyphens and underscores.
pub fn validate_region(region: &str) -> KeeperResult<()> {
    let valid = (1..=64).contains(&region.len())
        && region
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!("invalid region {region:?}")))
    }
}

/// Access key ids are printable ASCII without whitespace.
pub fn validate_access_key(key: &str) -> KeeperResult<()> {
    if (1..=128).contains(&key.len()) && key.chars().all(|c| c.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(KeeperError::config("invalid access key: expected printable characters without whitespace"))
    }
}

/// Relative key prefix inside a bucket, slashes allowed at either end.
pub fn validate_prefix(prefix: &str) -> KeeperResult<()> {
    let valid = !prefix.contains("..")
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!("invalid path prefix {prefix:?}")))
    }
}

/// A value for a `key=value` line of an ini file. A line break would start
/// a new option, so control characters are refused outright.
pub fn validate_ini_value(key: &str, value: &str) -> KeeperResult<()> {
    if value.chars().any(char::is_control) {
        Err(KeeperError::config(format!(
            "value for {key} contains control characters"
        )))
    } else {
        Ok(())
    }
}

/// Absolute path with no characters that need quoting.
pub fn validate_path(path: &str) -> KeeperResult<()> {
    let valid = path.starts_with('/')
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(KeeperError::config(format!("invalid path {path:?}")))
    }
}

/// SQL string literal with embedded quotes doubled.
pub fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Double-quoted SQL identifier. Callers validate the name first.
pub fn sql_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Run `script` through bash as root.
pub fn as_root(script: &str) -> String {
    format!("sudo -n bash -c {}", quote(script))
}

/// Run `script` through bash as the postgres OS user.
pub fn as_postgres(script: &str) -> String {
    format!("sudo -n -u postgres bash -c {}", quote(script))
}

/// `psql` against `database` as the postgres superuser, stopping on the first error.
pub fn psql(database: &str, sql: &str) -> String {
    format!(
        "sudo -n -u postgres psql -X -q -v ON_ERROR_STOP=1 -d {} -c {}",
        quote(database),
        quote(sql)
    )
}

/// Single unaligned, header-free result of `sql` on stdout.
pub fn psql_value(database: &str, sql: &str) -> String {
    format!(
        "sudo -n -u postgres psql -X -tA -v ON_ERROR_STOP=1 -d {} -c {}",
        quote(database),
        quote(sql)
    )
}

/// Like `psql`, with each statement sent separately so none of them share an
/// implicit transaction (required for `ALTER SYSTEM`, `CREATE DATABASE`).
pub fn psql_each(database: &str, statements: &[String]) -> String {
    let mut cmd = format!(
        "sudo -n -u postgres psql -X -q -v ON_ERROR_STOP=1 -d {}",
        quote(database)
    );
    for sql in statements {
        cmd.push_str(" -c ");
        cmd.push_str(&quote(sql));
    }
    cmd
}
