//! Common utilities shared by the orchestrator and its helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};

/// Parse a `KEY=VALUE` override from the command line.
/// Keys are upper-cased so `qemuport=1` and `QEMUPORT=1` are the same variable.
pub fn parse_override(arg: &str) -> Option<(String, String)> {
    let (key, value) = arg.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_uppercase(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("numdisks=2"),
            Some(("NUMDISKS".to_string(), "2".to_string()))
        );
        assert_eq!(
            parse_override("HDD_1=a=b.qcow2"),
            Some(("HDD_1".to_string(), "a=b.qcow2".to_string()))
        );
        assert_eq!(parse_override("=x"), None);
        assert_eq!(parse_override("novalue"), None);
    }
}
