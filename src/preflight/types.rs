//! Preflight check types and report.

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Hard failure - the operation will not proceed.
    Fail,
    /// Proceeding, but the operator should know.
    Warn,
    /// Check not applicable or disabled.
    Skip,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self::with_status(name, CheckStatus::Pass, details)
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self::with_status(name, CheckStatus::Fail, details)
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self::with_status(name, CheckStatus::Warn, details)
    }

    pub fn skip(name: &str, details: &str) -> Self {
        Self::with_status(name, CheckStatus::Skip, details)
    }

    fn with_status(name: &str, status: CheckStatus, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub title: &'static str,
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if no check failed hard.
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    /// The check with this name, if it ran.
    pub fn find(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== {} ===\n", self.title);

        for check in &self.checks {
            let icon = match check.status {
                CheckStatus::Pass => "✓",
                CheckStatus::Fail => "✗",
                CheckStatus::Warn => "⚠",
                CheckStatus::Skip => "○",
            };

            let status_str = match check.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Fail => "FAIL",
                CheckStatus::Warn => "WARN",
                CheckStatus::Skip => "SKIP",
            };

            print!("  {} [{}] {}", icon, status_str, check.name);
            if let Some(details) = &check.details {
                println!(": {}", details);
            } else {
                println!();
            }
        }

        println!();
        let total = self.checks.len();
        let passed = self.count(CheckStatus::Pass);
        let failed = self.fail_count();
        let warned = self.warn_count();

        println!("Summary: {}/{} passed", passed, total);
        if failed > 0 {
            println!("         {} FAILED - cannot continue", failed);
        }
        if warned > 0 {
            println!("         {} warnings", warned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_fail() {
        let report = PreflightReport {
            title: "t",
            checks: vec![
                CheckResult::pass("a"),
                CheckResult::warn("b", "meh"),
                CheckResult::skip("c", "disabled"),
            ],
        };
        assert!(report.all_passed());
        assert_eq!(report.warn_count(), 1);

        let report = PreflightReport {
            title: "t",
            checks: vec![CheckResult::fail("kexec", "missing")],
        };
        assert!(!report.all_passed());
        assert_eq!(report.find("kexec").unwrap().status, CheckStatus::Fail);
    }
}
