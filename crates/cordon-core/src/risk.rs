//! Risk assessment and backend enforcement
//!
//! Pattern matching over source text is trivially evaded (`getattr(__builtins__,
//! "ev" + "al")`), so [`RiskPolicy::assess`] only produces an opinion. The one
//! place that opinion becomes a decision is [`required_backend`], and the
//! subprocess backend is only reachable from there for SAFE code.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use cordon_sandbox::{BackendKind, Language, RiskAssessment, RiskLevel};

use crate::config::RuleConfig;
use crate::{CoreError, Result};

/// How strictly risk is translated into isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Backend by risk alone; may fall back between isolated backends
    Permissive,
    /// Never falls back; unavailability fails closed
    #[default]
    Strict,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permissive => f.write_str("permissive"),
            Self::Strict => f.write_str("strict"),
        }
    }
}

impl FromStr for SecurityMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" => Ok(Self::Permissive),
            "strict" => Ok(Self::Strict),
            other => Err(CoreError::InvalidArgument(format!("unknown security mode: {other}"))),
        }
    }
}

const PY: &[Language] = &[Language::Python];
const SH: &[Language] = &[Language::Shell];
const JS: &[Language] = &[Language::JavaScript];
const ANY: &[Language] = &[];

/// Built-in rules, most severe tier first. A name may appear more than once
/// with language-specific patterns.
const BUILTIN_RULES: &[(&str, RiskLevel, &[Language], &str)] = &[
    // Critical: arbitrary code or process execution
    // builtins only: `re.compile(` and `obj.eval(` are attribute calls
    (
        "dynamic_eval",
        RiskLevel::Critical,
        PY,
        r"(?:^|[^.\w])(?:eval|exec|compile)\s*\(|\b__import__\s*\(|\bimportlib\b",
    ),
    ("dynamic_eval", RiskLevel::Critical, JS, r"(?:^|[^.\w$])eval\s*\(|\bnew\s+Function\s*\(|\bvm\.run\w*"),
    ("dynamic_eval", RiskLevel::Critical, SH, r"(?m)(?:^|[;&|(]\s*)(?:eval|source)\s|\$\(\s*(?:curl|wget)\b"),
    (
        "process_spawn",
        RiskLevel::Critical,
        PY,
        r"\bsubprocess\b|\bos\.(?:system|popen|spawn\w*|exec\w*|fork\w*|posix_spawn\w*)\b|\bpty\.spawn\b",
    ),
    ("process_spawn", RiskLevel::Critical, JS, r"\bchild_process\b|\b(?:execSync|spawnSync|execFile)\b"),
    ("native_code", RiskLevel::Critical, PY, r"\bctypes\b|\bcffi\b"),
    ("native_code", RiskLevel::Critical, JS, r"process\.dlopen|\bffi-napi\b|process\.binding"),
    (
        "destructive_shell",
        RiskLevel::Critical,
        ANY,
        r"\brm\s+-[a-zA-Z]*[rRf][a-zA-Z]*\s+(?:/|~|\*)|\bmkfs\b|\bdd\s+if=|:\(\)\s*\{|\b(?:shutdown|reboot|halt)\b|>\s*/dev/sd",
    ),
    (
        "remote_pipe_shell",
        RiskLevel::Critical,
        ANY,
        r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
    ),
    // High: side effects outside the process
    (
        "file_write",
        RiskLevel::High,
        PY,
        r#"\bopen\s*\([^)]*['"][wax]\+?b?['"]|\.write_(?:text|bytes)\s*\(|\bshutil\.|\bos\.(?:remove|unlink|rename|replace|rmdir|removedirs|makedirs|mkdir|chmod|truncate)\b"#,
    ),
    ("file_write", RiskLevel::High, JS, r"\bfs\.(?:write|append|unlink|rm|rename|mkdir|copyFile|truncate)\w*"),
    (
        "file_write",
        RiskLevel::High,
        SH,
        r"(?m)(?:^|\s)>{1,2}\s*[^\s&|]|\b(?:tee|cp|mv|touch|mkdir|rm|rmdir|ln|truncate)\s",
    ),
    (
        "network_access",
        RiskLevel::High,
        PY,
        r"\bsocket\b|\burllib\d?\b|\brequests\b|\bhttp\.client\b|\bhttpx\b|\baiohttp\b|\bftplib\b|\bsmtplib\b|\bparamiko\b",
    ),
    (
        "network_access",
        RiskLevel::High,
        JS,
        r#"\bfetch\s*\(|\brequire\s*\(\s*['"](?:net|http|https|http2|dgram|tls)['"]\s*\)|\bXMLHttpRequest\b|\bWebSocket\b"#,
    ),
    (
        "network_access",
        RiskLevel::High,
        SH,
        r"\b(?:curl|wget|nc|ncat|netcat|ssh|scp|sftp|telnet|ftp|rsync)\s|/dev/(?:tcp|udp)/",
    ),
    (
        "privilege_change",
        RiskLevel::High,
        ANY,
        r"\bsudo\b|\bsu\s+-|\bset(?:e|re|res)?[ug]id\b|\bchmod\s+(?:[ug]?\+s|[0-7]?[4-7][0-7]{3})\b|\bchown\b|\bcapsh\b",
    ),
    // Medium: reads and parsing of untrusted data
    (
        "file_read",
        RiskLevel::Medium,
        PY,
        r"\bopen\s*\(|\.read_(?:text|bytes)\s*\(|\bos\.(?:listdir|scandir|walk)\b|\bglob\.",
    ),
    ("file_read", RiskLevel::Medium, JS, r"\bfs\.(?:read|readdir|createReadStream|stat|exists)\w*"),
    ("file_read", RiskLevel::Medium, SH, r"\b(?:cat|head|tail|less|more|find|grep|xxd|strings)\s"),
    (
        "deserialization",
        RiskLevel::Medium,
        PY,
        r"\bpickle\b|\bmarshal\b|\bshelve\b|\bdill\b|\bjsonpickle\b|\byaml\.(?:load|unsafe_load|full_load)\b",
    ),
    ("deserialization", RiskLevel::Medium, JS, r"\bnode-serialize\b|\bunserialize\s*\("),
    ("environment_access", RiskLevel::Medium, PY, r"\bos\.(?:environ|getenv|putenv)\b"),
    ("environment_access", RiskLevel::Medium, JS, r"\bprocess\.env\b"),
    ("environment_access", RiskLevel::Medium, SH, r"(?m)(?:^|[;&|]\s*)(?:env|printenv|export|set)\b"),
    (
        "reflection",
        RiskLevel::Medium,
        PY,
        r"\b(?:getattr|setattr|delattr|globals|locals|vars)\s*\(|__(?:builtins|subclasses|globals|class|bases|mro|code)__",
    ),
    ("reflection", RiskLevel::Medium, JS, r"\bReflect\.|\b__proto__\b|\bconstructor\.constructor\b|\bglobalThis\b"),
    // Low: worth noting, harmless on its own
    (
        "os_module_import",
        RiskLevel::Low,
        PY,
        r"(?m)^\s*(?:import|from)\s+(?:os|sys|shutil|pathlib|signal|resource|multiprocessing|threading)\b",
    ),
    ("os_module_import", RiskLevel::Low, JS, r#"\brequire\s*\(\s*['"](?:os|fs|path|process|cluster|worker_threads)['"]\s*\)"#),
    // Reported only; the wall-clock timeout handles these
    ("busy_loop", RiskLevel::Safe, PY, r"\bwhile\s+(?:True|1)\s*:"),
    ("busy_loop", RiskLevel::Safe, JS, r"\bwhile\s*\(\s*(?:true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\)"),
    ("busy_loop", RiskLevel::Safe, SH, r"\bwhile\s+(?:true|:)\s*;?\s*do\b|\buntil\s+false\b"),
];

struct Rule {
    name: String,
    level: RiskLevel,
    languages: Vec<Language>,
    regex: Regex,
}

impl Rule {
    fn applies_to(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }
}

/// Pure, deterministic static inspection of code payloads
pub struct RiskPolicy {
    rules: Vec<Rule>,
}

impl RiskPolicy {
    /// Policy with the built-in rule table
    pub fn new() -> Result<Self> {
        let mut rules = Vec::with_capacity(BUILTIN_RULES.len());
        for (name, level, languages, pattern) in BUILTIN_RULES {
            rules.push(compile(name, *level, languages.to_vec(), pattern)?);
        }
        Ok(Self { rules })
    }

    /// Built-in rules followed by operator-supplied ones
    pub fn with_rules(custom: &[RuleConfig]) -> Result<Self> {
        let mut policy = Self::new()?;
        for rule in custom {
            policy
                .rules
                .push(compile(&rule.name, rule.level, rule.languages.clone(), &rule.pattern)?);
        }
        Ok(policy)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Highest matched severity plus the names of every matched rule, in
    /// table order without duplicates
    pub fn assess(&self, code: &str, language: Language) -> RiskAssessment {
        let mut level = RiskLevel::Safe;
        let mut detected_patterns: Vec<String> = Vec::new();

        for rule in self.rules.iter().filter(|r| r.applies_to(language)) {
            if !rule.regex.is_match(code) {
                continue;
            }
            level = level.max(rule.level);
            if !detected_patterns.iter().any(|p| p == &rule.name) {
                detected_patterns.push(rule.name.clone());
            }
        }

        RiskAssessment {
            level,
            detected_patterns,
        }
    }
}

fn compile(name: &str, level: RiskLevel, languages: Vec<Language>, pattern: &str) -> Result<Rule> {
    let regex = Regex::new(pattern).map_err(|source| CoreError::InvalidRule {
        name: name.to_string(),
        source,
    })?;
    Ok(Rule {
        name: name.to_string(),
        level,
        languages,
        regex,
    })
}

/// An enforceable backend choice. Only [`required_backend`] creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDecision {
    kind: BackendKind,
    minimum: BackendKind,
    fallback: Option<BackendKind>,
}

impl BackendDecision {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Weakest isolation this request may run under
    pub fn minimum(&self) -> BackendKind {
        self.minimum
    }

    /// Backend to use if `kind` is unavailable. Never weaker than `minimum`.
    pub fn fallback(&self) -> Option<BackendKind> {
        self.fallback
    }
}

/// Convert a risk opinion into the backend a request must run on.
///
/// SAFE code may run as a subprocess; anything else needs a container or
/// stronger. A caller preference can raise isolation, never lower it.
pub fn required_backend(
    assessment: &RiskAssessment,
    mode: SecurityMode,
    preference: Option<BackendKind>,
) -> BackendDecision {
    let minimum = if assessment.level == RiskLevel::Safe {
        BackendKind::Subprocess
    } else {
        BackendKind::Container
    };
    let kind = preference.map_or(minimum, |p| p.max(minimum));
    let fallback = match mode {
        SecurityMode::Strict => None,
        SecurityMode::Permissive => match kind {
            BackendKind::Pooled => Some(BackendKind::Container),
            BackendKind::Container => Some(BackendKind::Pooled),
            BackendKind::Subprocess => Some(BackendKind::Container),
        },
    };
    BackendDecision {
        kind,
        minimum,
        fallback: fallback.filter(|f| *f >= minimum),
    }
}
