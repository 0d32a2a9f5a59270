//! Blocking I/O Prohibition
//!
//! Async functions must not block a runtime worker: no `std::fs`, `std::net`,
//! `std::process::Command` or `reqwest::blocking` inside `async fn`. Synchronous
//! startup code (config loading before the runtime serves traffic) is exempt.
//! `reqwest::blocking` is banned everywhere.

use architectural_enforcement::{in_async_fn, production_files, scan_file};

const BLOCKING_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::thread::sleep", "Blocking sleep"),
];

fn blocking_rule(lines: &[(usize, String)], idx: usize) -> Option<String> {
    let code = &lines[idx].1;

    if code.contains("reqwest::blocking") {
        return Some(format!("Blocking HTTP client: {}", code.trim()));
    }
    if code.trim_start().starts_with("use std::net") {
        return Some(format!("Blocking network import: {}", code.trim()));
    }

    let (_, label) = BLOCKING_IN_ASYNC
        .iter()
        .find(|(pattern, _)| code.contains(pattern))?;
    if in_async_fn(lines, idx) {
        Some(format!("{label} in async fn: {}", code.trim()))
    } else {
        None
    }
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations: Vec<_> = production_files()
        .iter()
        .flat_map(|path| scan_file(path, blocking_rule))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in async code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs, tokio::net, tokio::process and async reqwest.");

        panic!("Found {} blocking I/O violation(s)", violations.len());
    }
}

#[test]
fn test_rule_allows_sync_config_loading() {
    let lines = vec![
        (1, "pub fn load_config_from_path() {".to_string()),
        (2, "    let s = std::fs::read_to_string(p);".to_string()),
        (3, "}".to_string()),
        (4, "pub async fn probe() {".to_string()),
        (5, "    let s = std::fs::read_to_string(p);".to_string()),
        (6, "}".to_string()),
    ];
    assert!(blocking_rule(&lines, 1).is_none());
    assert!(blocking_rule(&lines, 4).is_some());
}

#[test]
fn test_rule_rejects_blocking_reqwest_anywhere() {
    let lines = vec![(1, "let c = reqwest::blocking::Client::new();".to_string())];
    assert!(blocking_rule(&lines, 0).is_some());
}
