//! Convenience functions throughout the crate go here
use std::io::Read;
use std::path::Path;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

fn trim_trailing_whitespace(s: &str) -> String {
    s.trim_end().to_string()
}

/// Reads a client secret from a file, dropping the trailing newline editors like to add.
pub fn load_client_secret<P: AsRef<Path>>(secret_file: P) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(secret_file.as_ref())?;
    let mut contents = String::new();

    file.read_to_string(&mut contents)?;
    Ok(trim_trailing_whitespace(&contents))
}

/// Compares two secrets without leaking the position of the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
