//! Reader and writer for the `key=value` line format of the registry cache
//! file. The format is the one of Java `.properties` files, so caches can be
//! shared with tooling that already reads those.
//!
//! Output is pure ASCII: anything outside printable ASCII is written as a
//! `\uXXXX` escape of its UTF-16 code units.

use std::fmt::Write;

use chrono::Local;

const WHITESPACE: [char; 3] = [' ', '\t', '\x0c'];

/// Renders `entries` with a `#` comment line and a timestamp line on top.
pub fn render<'a, I>(comment: &str, entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    if !comment.is_empty() {
        let _ = writeln!(out, "#{}", escape(comment, Part::Comment));
    }
    let _ = writeln!(out, "#{}", Local::now().format("%a %b %d %H:%M:%S %Z %Y"));
    for (key, value) in entries {
        let _ = writeln!(
            out,
            "{}={}",
            escape(key, Part::Key),
            escape(value, Part::Value)
        );
    }
    out
}

/// Parses every entry of `text`, in file order. Later duplicates of a key
/// are returned as well; callers decide which one wins.
pub fn parse(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let line = line.trim_start_matches(WHITESPACE);
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let mut logical = line.to_owned();
        while continues(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => {
                    logical.push_str(next.trim_start_matches(WHITESPACE))
                }
                None => break,
            }
        }
        entries.push(split_entry(&logical));
    }
    entries
}

// An odd number of trailing backslashes joins the next line.
fn continues(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (String, String) {
    let chars: Vec<char> = line.chars().collect();
    let mut key_end = chars.len();
    let mut escaped = false;
    for (i, c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\x0c' => {
                key_end = i;
                break;
            }
            _ => {}
        }
    }

    let is_space = |c: char| WHITESPACE.contains(&c);
    let mut value_start = key_end;
    while value_start < chars.len() && is_space(chars[value_start]) {
        value_start += 1;
    }
    if value_start < chars.len() && matches!(chars[value_start], '=' | ':') {
        value_start += 1;
        while value_start < chars.len() && is_space(chars[value_start]) {
            value_start += 1;
        }
    }
    (unescape(&chars[..key_end]), unescape(&chars[value_start..]))
}

fn unescape(chars: &[char]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(chars.len());
    let mut buf = [0u16; 2];
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '\\' {
            units.extend_from_slice(c.encode_utf16(&mut buf));
            continue;
        }
        let Some(&next) = chars.get(i) else {
            break;
        };
        i += 1;
        let plain = match next {
            't' => '\t',
            'n' => '\n',
            'r' => '\r',
            'f' => '\x0c',
            'u' => {
                let hex: String = chars[i..chars.len().min(i + 4)].iter().collect();
                match u16::from_str_radix(&hex, 16) {
                    Ok(unit) if hex.len() == 4 => {
                        units.push(unit);
                        i += 4;
                        continue;
                    }
                    // malformed escapes keep the `u`
                    _ => 'u',
                }
            }
            other => other,
        };
        units.extend_from_slice(plain.encode_utf16(&mut buf));
    }
    String::from_utf16_lossy(&units)
}

#[derive(Clone, Copy, PartialEq)]
enum Part {
    Key,
    Value,
    Comment,
}

fn escape(text: &str, part: Part) -> String {
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u16; 2];
    for (i, c) in text.chars().enumerate() {
        match c {
            _ if part == Part::Comment && matches!(c, '\n' | '\r') => {
                out.push(' ')
            }
            ' ' if i == 0 || part == Part::Key => out.push_str("\\ "),
            '\\' if part != Part::Comment => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' if part != Part::Comment => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            _ => {
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{unit:04X}");
                }
            }
        }
    }
    out
}
