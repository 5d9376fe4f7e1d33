use sysinfo::System;
use url::Url;

const IEC_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Renders a byte count with binary (1024-based) units, e.g. `5.0 MiB`.
pub fn format_size_iec(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < IEC_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, IEC_UNITS[unit])
}

/// Masks the password of a libpq connection string so it can be logged.
/// Accepts both URI (`postgres://user:pw@host/db`) and keyword/value
/// (`host=db password=pw`) forms.
pub fn redact_connection_string(raw: &str) -> String {
    if !raw.contains("://") {
        return redact_conninfo(raw);
    }
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

fn redact_conninfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let (gap, tail) = split_leading_space(rest);
        out.push_str(gap);
        if tail.is_empty() {
            return out;
        }

        let key_len = tail
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(tail.len());
        let (key, tail) = tail.split_at(key_len);
        out.push_str(key);

        let (gap, tail) = split_leading_space(tail);
        out.push_str(gap);
        let Some(tail) = tail.strip_prefix('=') else {
            rest = tail;
            continue;
        };
        out.push('=');

        let (gap, tail) = split_leading_space(tail);
        out.push_str(gap);
        let (value, tail) = tail.split_at(conninfo_value_len(tail));
        if key == "password" && !value.is_empty() {
            out.push_str("****");
        } else {
            out.push_str(value);
        }
        rest = tail;
    }
}

fn split_leading_space(s: &str) -> (&str, &str) {
    let trimmed = s.trim_start();
    s.split_at(s.len() - trimmed.len())
}

/// Length of one conninfo value. Single-quoted values may hold spaces and `\'`.
fn conninfo_value_len(s: &str) -> usize {
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '\'' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => return i,
            _ => {}
        }
    }
    s.len()
}

/// Memory figures for the running process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub resident: u64,
    pub virtual_size: u64,
}

impl MemoryStats {
    /// Samples the current process. Returns zeros when the platform gives nothing back.
    pub fn current() -> Self {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return MemoryStats::default();
        };
        let mut system = System::new();
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| MemoryStats {
                resident: process.memory(),
                virtual_size: process.virtual_memory(),
            })
            .unwrap_or_default()
    }
}
