use std::{
    process::Command,
    sync::{Mutex, MutexGuard},
};

use tracing::debug;

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const IPTABLES_BIN: &str = "iptables";

static IPTABLES_LOCK: Mutex<()> = Mutex::new(());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A thin wrapper over the `iptables` command for one table.
///
/// Commands act on the network namespace of the calling thread, so they are meant to run inside
/// [`Namespace::run_blocking`](super::Namespace::run_blocking).
#[derive(Debug, Clone)]
pub struct Iptables {
    table: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Iptables {
    /// Creates a wrapper for `table`, such as `raw` or `filter`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Serializes multi-step chain manipulation across the process.
    pub fn lock() -> MutexGuard<'static, ()> {
        IPTABLES_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `rule` exists in `chain`.
    pub fn exists(&self, chain: &str, rule: &[String]) -> PeerpodResult<bool> {
        match self.run(&["-C", chain], rule) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Appends `rule` to `chain` unless it is already there.
    pub fn append_unique(&self, chain: &str, rule: &[String]) -> PeerpodResult<()> {
        if self.exists(chain, rule)? {
            return Ok(());
        }

        self.run(&["-A", chain], rule)?;
        debug!(table = %self.table, chain, ?rule, "appended iptables rule");
        Ok(())
    }

    /// Deletes `rule` from `chain`.
    pub fn delete(&self, chain: &str, rule: &[String]) -> PeerpodResult<()> {
        self.run(&["-D", chain], rule)?;
        debug!(table = %self.table, chain, ?rule, "deleted iptables rule");
        Ok(())
    }

    /// Whether a chain exists.
    pub fn chain_exists(&self, chain: &str) -> PeerpodResult<bool> {
        match self.run(&["-S", chain], &[]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Creates a user chain.
    pub fn new_chain(&self, chain: &str) -> PeerpodResult<()> {
        match self.run(&["-N", chain], &[]) {
            Err(e) if !e.is_already_exists() => Err(e),
            _ => Ok(()),
        }
    }

    /// Deletes an empty user chain.
    pub fn delete_chain(&self, chain: &str) -> PeerpodResult<()> {
        self.run(&["-X", chain], &[])?;
        Ok(())
    }

    /// Lists the rules of a chain in `-S` format. The first line is the chain declaration.
    pub fn list(&self, chain: &str) -> PeerpodResult<Vec<String>> {
        let output = self.run(&["-S", chain], &[])?;
        Ok(output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Creates `chain` if needed and jumps to it from `base`.
    pub fn ensure_chain(&self, base: &str, chain: &str) -> PeerpodResult<()> {
        if !self.chain_exists(chain)? {
            self.new_chain(chain)?;
        }
        self.append_unique(base, &jump(chain))
    }

    /// Removes `chain` and the jump from `base` once the chain holds no rules.
    pub fn remove_chain_if_empty(&self, base: &str, chain: &str) -> PeerpodResult<()> {
        if !self.chain_exists(chain)? {
            return Ok(());
        }
        if self.list(chain)?.len() > 1 {
            return Ok(());
        }

        match self.delete(base, &jump(chain)) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.delete_chain(chain)
    }

    fn run(&self, command: &[&str], rule: &[String]) -> PeerpodResult<String> {
        let output = Command::new(IPTABLES_BIN)
            .args(["-w", "-t", &self.table])
            .args(command)
            .args(rule)
            .output()?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(output.status.code(), &stderr, &self.table, command))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the `-j <chain>` rule used to link a user chain from a base chain.
pub fn jump(chain: &str) -> Vec<String> {
    vec!["-j".to_string(), chain.to_string()]
}

/// Splits a rule written as a shell-like string into arguments, honoring double quotes.
pub fn split_rule(rule: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_token = false;

    for c in rule.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                has_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }

    args
}

fn classify_failure(code: Option<i32>, stderr: &str, table: &str, command: &[&str]) -> PeerpodError {
    let message = format!("iptables -t {table} {}: {stderr}", command.join(" "));
    let missing = stderr.contains("does a matching rule exist")
        || stderr.contains("No chain/target/match by that name")
        || stderr.contains("doesn't exist");

    match code {
        Some(1) if missing || command.first() == Some(&"-C") => PeerpodError::NotFound(message),
        Some(1) if stderr.contains("Chain already exists") => PeerpodError::AlreadyExists(message),
        _ => PeerpodError::Internal(message),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::ErrorKind;

    use super::*;

    #[test]
    fn test_split_rule_honors_quotes() {
        let args = split_rule(
            r#"-m comment --comment "peerpod [vni:555001]" -d 10.0.0.5 -p udp -j NOTRACK"#,
        );
        assert_eq!(
            args,
            vec![
                "-m",
                "comment",
                "--comment",
                "peerpod [vni:555001]",
                "-d",
                "10.0.0.5",
                "-p",
                "udp",
                "-j",
                "NOTRACK"
            ]
        );
        assert!(split_rule("   ").is_empty());
        assert_eq!(split_rule(r#"--comment """#), vec!["--comment", ""]);
    }

    #[test]
    fn test_classify_failure() {
        let check = classify_failure(Some(1), "iptables: Bad rule.", "raw", &["-C", "OUTPUT"]);
        assert_eq!(check.kind(), ErrorKind::NotFound);

        let delete = classify_failure(
            Some(1),
            "iptables: Bad rule (does a matching rule exist in that chain?).",
            "raw",
            &["-D", "OUTPUT"],
        );
        assert_eq!(delete.kind(), ErrorKind::NotFound);

        let exists = classify_failure(
            Some(1),
            "iptables: Chain already exists.",
            "raw",
            &["-N", "PEERPOD"],
        );
        assert_eq!(exists.kind(), ErrorKind::AlreadyExists);

        let other = classify_failure(Some(2), "iptables v1.8: unknown option", "raw", &["-A"]);
        assert_eq!(other.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_jump_rule() {
        assert_eq!(jump("peerpod-OUTPUT"), vec!["-j", "peerpod-OUTPUT"]);
    }
}
