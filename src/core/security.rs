/// Query inspection policy
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

/// Decides whether a client query may reach a backend
pub trait SecurityChecker: Send + Sync {
    /// Returns the reason when the query must be blocked
    fn check_query(&self, query: &str) -> Option<String>;
}

/// Substrings that mark a statement as an injection attempt
const SUSPICIOUS_SQL: &[&str] = &[
    "union select",
    "union all select",
    "' or '1'='1",
    "\" or \"1\"=\"1",
    "' or 1=1",
    "or 1=1--",
    "; drop table",
    "; drop database",
    "; shutdown",
    "sleep(",
    "benchmark(",
    "waitfor delay",
    "xp_cmdshell",
    "load_file(",
    "into outfile",
    "into dumpfile",
    "information_schema.",
];

/// Case-insensitive keyword matcher over the raw query text
pub struct KeywordChecker {
    finder: AhoCorasick,
    patterns: Vec<String>,
}

impl KeywordChecker {
    pub fn new<I, S>(patterns: I) -> Result<Self, aho_corasick::BuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let finder = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(&patterns)?;
        Ok(Self { finder, patterns })
    }

    /// Checker loaded with the built-in SQL injection patterns
    pub fn sql_injection() -> Result<Self, aho_corasick::BuildError> {
        Self::new(SUSPICIOUS_SQL.iter().copied())
    }
}

impl SecurityChecker for KeywordChecker {
    fn check_query(&self, query: &str) -> Option<String> {
        self.finder.find(query).map(|m| {
            format!(
                "matched suspicious pattern '{}'",
                self.patterns[m.pattern().as_usize()]
            )
        })
    }
}

/// Redis commands refused when dangerous-command blocking is enabled
const BLOCKED_REDIS_COMMANDS: &[&str] = &[
    "FLUSHDB", "FLUSHALL", "SHUTDOWN", "DEBUG", "CONFIG", "EVAL", "EVALSHA", "SCRIPT", "CLIENT",
    "MONITOR", "SYNC", "PSYNC", "CLUSTER", "MODULE", "ACL",
];

/// `command` must already be upper-cased
pub fn is_blocked_redis_command(command: &str) -> bool {
    BLOCKED_REDIS_COMMANDS.contains(&command)
}
