//! Sleep Prohibition
//!
//! Production code waits on events, intervals and timeouts, never on sleep().
//! Periodic work uses `tokio::time::interval`; bounded waits use
//! `tokio::time::timeout`. Test code may sleep freely.

use architectural_enforcement::{production_files, scan_file};

fn sleep_rule(lines: &[(usize, String)], idx: usize) -> Option<String> {
    let code = &lines[idx].1;
    if code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(") {
        Some(format!("sleep call: {}", code.trim()))
    } else {
        None
    }
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<_> = production_files()
        .iter()
        .flat_map(|path| scan_file(path, sleep_rule))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::time::interval for periodic work,");
        eprintln!("tokio::time::timeout for bounded waits and Notify/watch for events.");

        panic!("Found {} sleep violation(s) in production code", violations.len());
    }
}

#[test]
fn test_rule_detects_sleep() {
    let lines = vec![(
        3,
        "    tokio::time::sleep(Duration::from_millis(10)).await;".to_string(),
    )];
    assert!(sleep_rule(&lines, 0).is_some());

    let lines = vec![(3, "    interval.tick().await;".to_string())];
    assert!(sleep_rule(&lines, 0).is_none());
}
