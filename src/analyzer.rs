//! Shell-command preflight analyzer.
//!
//! Expands a shell command string into its simple commands — across `;`,
//! `&&`, `||`, pipelines, groupings, and nested `sh -c` invocations — and
//! matches each against the command policy's allow/deny prefix rules.
//! Quoting (single, double, backslash) is honored during tokenization, so
//! `sh -c "ls && git push"` is inspected recursively.

use std::path::Path;

use tracing::{debug, trace};

use crate::config::{CommandConfig, Config, DEFAULT_DENIED_COMMANDS};

/// Shells whose `-c` payloads are inspected recursively.
const SHELLS: &[&str] = &["sh", "bash", "zsh", "ksh", "dash", "fish"];

/// Recursion cap for nested `sh -c 'sh -c ...'` chains.
const MAX_SHELL_DEPTH: usize = 8;

/// Preflight verdict for a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// A deny rule matched a simple command and no allow rule overrode it.
    Deny {
        /// The deny pattern that matched.
        pattern: String,
        /// The simple command it matched.
        command: String,
    },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// An `ssh host [command]` invocation extracted from a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInvocation {
    pub host: String,
    /// The remote command, or None for an interactive session.
    pub command: Option<String>,
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(&'static str),
}

/// Tokenize a shell command string, honoring single quotes, double quotes,
/// and backslash escapes. Operators come out as separate tokens.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut word = String::new();
    let mut in_word = false;

    macro_rules! flush {
        () => {
            if in_word {
                tokens.push(Token::Word(std::mem::take(&mut word)));
                in_word = false;
            }
        };
    }

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => {
                flush!();
                i += 1;
            }
            '\n' => {
                flush!();
                tokens.push(Token::Op(";"));
                i += 1;
            }
            '#' if !in_word => {
                // Comment to end of line.
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '\'' => {
                in_word = true;
                i += 1;
                while i < bytes.len() && bytes[i] != b'\'' {
                    word.push(bytes[i] as char);
                    i += 1;
                }
                i += 1; // closing quote (or end of input)
            }
            '"' => {
                in_word = true;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        word.push(bytes[i + 1] as char);
                        i += 2;
                    } else {
                        word.push(bytes[i] as char);
                        i += 1;
                    }
                }
                i += 1;
            }
            '\\' => {
                if i + 1 < bytes.len() {
                    in_word = true;
                    word.push(bytes[i + 1] as char);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            '&' | '|' | ';' | '(' | ')' | '<' | '>' => {
                // A digit run glued to a redirect (2>, 2>&1) is the fd
                // number, not an argument.
                if in_word
                    && matches!(c, '<' | '>')
                    && !word.is_empty()
                    && word.bytes().all(|b| b.is_ascii_digit())
                {
                    word.clear();
                    in_word = false;
                }
                flush!();
                let rest = &input[i..];
                let op: &'static str = if rest.starts_with("&&") {
                    "&&"
                } else if rest.starts_with("||") {
                    "||"
                } else if rest.starts_with("&>>") || rest.starts_with("&>") {
                    "&>"
                } else if rest.starts_with(">>") {
                    ">>"
                } else if rest.starts_with(">&") {
                    ">&"
                } else {
                    match c {
                        '&' => "&",
                        '|' => "|",
                        ';' => ";",
                        '(' => "(",
                        ')' => ")",
                        '<' => "<",
                        _ => ">",
                    }
                };
                tokens.push(Token::Op(op));
                i += op.len();
            }
            _ => {
                in_word = true;
                word.push(c);
                i += 1;
            }
        }
    }
    flush!();
    tokens
}

/// Split a token stream into simple commands, stripping redirections,
/// grouping braces, and background markers.
fn split_simple_commands(tokens: &[Token]) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Op(op) => {
                match *op {
                    ";" | "&&" | "||" | "|" | "&" | "(" | ")" => {
                        if !current.is_empty() {
                            commands.push(std::mem::take(&mut current));
                        }
                    }
                    "<" | ">" | ">>" | "&>" | ">&" => {
                        // Drop the redirect target word.
                        if matches!(tokens.get(i + 1), Some(Token::Word(_))) {
                            i += 1;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            Token::Word(w) => {
                if w == "{" || w == "}" {
                    if !current.is_empty() && w == "}" {
                        commands.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(w.clone());
                }
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        commands.push(current);
    }
    commands
}

/// Strip leading `VAR=value` environment assignments.
fn strip_env_assignments(words: &[String]) -> &[String] {
    let mut start = 0;
    for w in words {
        let is_assignment = w
            .split_once('=')
            .is_some_and(|(name, _)| {
                !name.is_empty()
                    && name
                        .bytes()
                        .enumerate()
                        .all(|(i, b)| b == b'_' || b.is_ascii_alphabetic() || (i > 0 && b.is_ascii_digit()))
            });
        if is_assignment {
            start += 1;
        } else {
            break;
        }
    }
    &words[start..]
}

fn basename(word: &str) -> &str {
    Path::new(word)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(word)
}

/// If `words` is a shell invocation with a `-c`-style flag, return the
/// payload string to analyze recursively.
fn shell_c_payload(words: &[String]) -> Option<&str> {
    if words.is_empty() || !SHELLS.contains(&basename(&words[0])) {
        return None;
    }
    let mut want_payload = false;
    for arg in &words[1..] {
        if want_payload {
            return Some(arg);
        }
        if let Some(flags) = arg.strip_prefix('-') {
            if flags.contains('c') {
                want_payload = true;
            }
        } else {
            // First non-flag argument without -c is a script path, not a payload.
            return None;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Prefix matching
// ---------------------------------------------------------------------------

/// Collapse whitespace so patterns and commands compare token-wise.
fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-normalize a command string for prefix comparison.
pub fn normalize_command(s: &str) -> String {
    normalize(s)
}

/// Word-boundary prefix match between a policy pattern and a normalized
/// command string. Used by the SSH inspector's command rules.
pub fn command_prefix_matches(pattern: &str, command: &str) -> bool {
    prefix_matches(&normalize(pattern), command)
}

/// Word-boundary prefix match: the pattern must match from the start of the
/// command, ending either at the command end, before a space, or on a
/// non-alphanumeric pattern tail (so `dd if=` matches `dd if=/dev/sda`).
fn prefix_matches(pattern: &str, command: &str) -> bool {
    if pattern.is_empty() || !command.starts_with(pattern) {
        return false;
    }
    if command.len() == pattern.len() {
        return true;
    }
    let next = command.as_bytes()[pattern.len()];
    let last = *pattern.as_bytes().last().unwrap();
    next == b' ' || !last.is_ascii_alphanumeric()
}

/// Longest pattern in `patterns` matching `command` (also tried with the
/// first word reduced to its basename, so `/usr/bin/git push` hits
/// `git push` rules).
fn best_match<'a, I>(patterns: I, command: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let base_form = {
        let mut words: Vec<&str> = command.split(' ').collect();
        if let Some(first) = words.first_mut() {
            *first = basename(first);
        }
        words.join(" ")
    };

    let mut best: Option<String> = None;
    for raw in patterns {
        let pattern = normalize(raw);
        if prefix_matches(&pattern, command) || prefix_matches(&pattern, &base_form) {
            if best.as_ref().is_none_or(|b| pattern.len() > b.len()) {
                best = Some(pattern);
            }
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Analyze a command string against the command policy.
///
/// Every simple command in the expansion is checked; a deny hit wins unless
/// an allow prefix also matches with at least the deny match's length.
pub fn analyze(command: &str, policy: &CommandConfig) -> Verdict {
    let deny: Vec<&str> = effective_deny(policy);
    let allow: Vec<&str> = policy.allow.iter().map(String::as_str).collect();
    analyze_depth(command, &deny, &allow, 0)
}

fn effective_deny(policy: &CommandConfig) -> Vec<&str> {
    let mut deny: Vec<&str> = policy.deny.iter().map(String::as_str).collect();
    if policy.use_default_denied_commands() {
        deny.extend(DEFAULT_DENIED_COMMANDS.iter().copied());
    }
    deny
}

fn analyze_depth(command: &str, deny: &[&str], allow: &[&str], depth: usize) -> Verdict {
    if depth > MAX_SHELL_DEPTH {
        return Verdict::Allow;
    }

    for words in split_simple_commands(&tokenize(command)) {
        let words = strip_env_assignments(&words);
        if words.is_empty() {
            continue;
        }

        if let Some(payload) = shell_c_payload(words) {
            if let Verdict::Deny { pattern, command } =
                analyze_depth(payload, deny, allow, depth + 1)
            {
                return Verdict::Deny { pattern, command };
            }
            continue;
        }

        let simple = normalize(&words.join(" "));
        trace!(command = %simple, "checking simple command");

        if let Some(deny_hit) = best_match(deny.iter().copied(), &simple) {
            let allow_hit = best_match(allow.iter().copied(), &simple);
            let overridden = allow_hit
                .as_ref()
                .is_some_and(|a| a.len() >= deny_hit.len());
            if !overridden {
                debug!(command = %simple, pattern = %deny_hit, "command denied by policy");
                return Verdict::Deny {
                    pattern: deny_hit,
                    command: simple,
                };
            }
        }
    }

    Verdict::Allow
}

// ---------------------------------------------------------------------------
// SSH extraction
// ---------------------------------------------------------------------------

/// SSH client options that consume a following argument.
const SSH_VALUE_OPTIONS: &[&str] = &[
    "-p", "-i", "-o", "-F", "-l", "-L", "-R", "-D", "-W", "-J", "-E", "-b", "-e", "-m", "-O",
    "-Q", "-S", "-w", "-B", "-c",
];

/// Extract `ssh host [command]` invocations from a command string,
/// including ones nested inside `sh -c` payloads.
pub fn extract_ssh_invocations(command: &str) -> Vec<SshInvocation> {
    let mut out = Vec::new();
    extract_ssh_depth(command, &mut out, 0);
    out
}

fn extract_ssh_depth(command: &str, out: &mut Vec<SshInvocation>, depth: usize) {
    if depth > MAX_SHELL_DEPTH {
        return;
    }
    for words in split_simple_commands(&tokenize(command)) {
        let words = strip_env_assignments(&words);
        if words.is_empty() {
            continue;
        }
        if let Some(payload) = shell_c_payload(words) {
            extract_ssh_depth(payload, out, depth + 1);
            continue;
        }
        if basename(&words[0]) != "ssh" {
            continue;
        }
        if let Some(invocation) = parse_ssh_args(&words[1..]) {
            out.push(invocation);
        }
    }
}

fn parse_ssh_args(args: &[String]) -> Option<SshInvocation> {
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--" {
            i += 1;
            break;
        }
        if arg.starts_with('-') {
            if SSH_VALUE_OPTIONS.contains(&arg.as_str()) {
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        break;
    }

    let host_arg = args.get(i)?;
    // user@host and ssh://user@host:port forms.
    let host = host_arg
        .strip_prefix("ssh://")
        .unwrap_or(host_arg)
        .rsplit('@')
        .next()
        .unwrap_or(host_arg)
        .split(':')
        .next()
        .unwrap_or(host_arg)
        .to_string();

    let rest = &args[i + 1..];
    let command = if rest.is_empty() {
        None
    } else {
        Some(normalize(&rest.join(" ")))
    };

    Some(SshInvocation { host, command })
}

// ---------------------------------------------------------------------------
// Runtime exec deny resolution
// ---------------------------------------------------------------------------

const COMMON_EXECUTABLE_DIRS: &[&str] = &[
    "/usr/bin",
    "/bin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
];

/// Resolve single-token deny rules to absolute executable paths for
/// exec-time enforcement layers.
///
/// Intentionally conservative: only rules that are a single executable
/// token are included; prefix rules with arguments (`git push`, `dd if=`)
/// remain preflight-only.
pub fn runtime_denied_executable_paths(config: &Config) -> Vec<std::path::PathBuf> {
    let deny = effective_deny(&config.command);

    let mut paths: Vec<std::path::PathBuf> = Vec::new();
    let mut push = |p: std::path::PathBuf| {
        if !paths.contains(&p) {
            paths.push(p);
        }
    };

    for rule in deny {
        let Some(token) = runtime_executable_token(rule) else {
            continue;
        };

        if token.contains('/') {
            let abs = normalize_executable(&token);
            if is_executable_file(&abs) {
                push(abs.clone());
                if let Ok(resolved) = std::fs::canonicalize(&abs) {
                    push(resolved);
                }
            }
            continue;
        }

        if let Ok(found) = which::which(&token) {
            push(found.clone());
            if let Ok(resolved) = std::fs::canonicalize(&found) {
                push(resolved);
            }
        }
        for dir in COMMON_EXECUTABLE_DIRS {
            let candidate = Path::new(dir).join(&token);
            if is_executable_file(&candidate) {
                push(candidate.clone());
                if let Ok(resolved) = std::fs::canonicalize(&candidate) {
                    push(resolved);
                }
            }
        }
    }

    paths.sort();
    paths
}

/// A deny rule qualifies for runtime enforcement only when it is a single
/// token free of shell-level matching syntax.
fn runtime_executable_token(rule: &str) -> Option<String> {
    let tokens = split_simple_commands(&tokenize(rule));
    let [only] = tokens.as_slice() else {
        return None;
    };
    let [token] = only.as_slice() else {
        return None;
    };
    if token.is_empty() || token.contains(['*', '?', '[', ']', '$', '`', '=']) {
        return None;
    }
    Some(token.clone())
}

fn normalize_executable(token: &str) -> std::path::PathBuf {
    let p = Path::new(token);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
