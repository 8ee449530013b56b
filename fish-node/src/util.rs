//! Small helpers shared across drivers.

use chrono::{Datelike, NaiveDate};
use rand::Rng;

/// Generates `prefix` followed by `len` random lowercase letters. The shape
/// of the result is load-bearing for the native driver: host privilege
/// escalation rules are written against it.
pub fn random_name(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut name = String::with_capacity(prefix.len() + len);
    name.push_str(prefix);
    for _ in 0..len {
        name.push(rng.gen_range(b'a'..=b'z') as char);
    }
    name
}

/// Month wildcards covering the year ending at `date`'s month inclusive,
/// newest first. Lets a driver filter dated image builds without
/// enumerating every day.
pub fn last_year_filter_values(date: NaiveDate) -> Vec<String> {
    let mut values = Vec::with_capacity(12);
    let mut year = date.year();
    let mut month = date.month();
    for _ in 0..12 {
        values.push(format!("{year}-{month:02}-*"));
        if month == 1 {
            month = 12;
            year -= 1;
        } else {
            month -= 1;
        }
    }
    values
}

/// Wraps `value` in single quotes for safe interpolation into a shell line.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
