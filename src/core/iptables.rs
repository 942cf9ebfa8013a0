//! iptables save-format model and merge
//!
//! Two halves:
//!
//! - [`FilterTable`]: the chains and rules vmfw owns in one address-family
//!   table, staged in memory between compile passes.
//! - [`SavedTables`]: an `iptables-save -c` dump. [`SavedTables::merge`]
//!   produces a new dump in which every line vmfw owns is replaced by the
//!   staged state while all other lines survive byte for byte.
//!
//! Owned chains are named `<prefix>-<name>`. Rule bodies refer to them as
//! `$name`; the reference is expanded when the table is rendered, and only
//! for chains that exist in the table, so `$` elsewhere passes through.

use crate::core::error::{Error, Result};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Builtin chains of the filter table that get a wrapped counterpart
pub const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

/// One rule owned by vmfw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRule {
    /// Short chain name (`inst-1`), or a builtin name when `wrap` is false
    pub chain: String,
    /// Everything after `-A <chain>`
    pub body: String,
    /// Chain is one of ours and gets the prefix
    pub wrap: bool,
    /// Rendered ahead of every unrelated rule
    pub top: bool,
}

/// The staged state of one address-family filter table
#[derive(Debug, Clone)]
pub struct FilterTable {
    prefix: String,
    /// Wrapped chains, in creation order
    chains: Vec<String>,
    rules: Vec<TableRule>,
}

impl FilterTable {
    /// Creates a table with the wrapped builtin chains and their top jumps.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut table = Self {
            prefix: prefix.into(),
            chains: Vec::new(),
            rules: Vec::new(),
        };
        for builtin in BUILTIN_CHAINS {
            table.chains.push(builtin.to_string());
            table.rules.push(TableRule {
                chain: builtin.to_string(),
                body: format!("-j ${builtin}"),
                wrap: false,
                top: true,
            });
        }
        table
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full name of a wrapped chain
    pub fn wrapped_name(&self, chain: &str) -> String {
        format!("{}-{chain}", self.prefix)
    }

    /// Adds a wrapped chain; adding an existing chain is a no-op.
    pub fn add_chain(&mut self, name: &str) -> Result<()> {
        crate::validators::validate_chain_name(&self.wrapped_name(name))
            .map_err(|e| Error::validation("chain", e))?;
        if !self.has_chain(name) {
            self.chains.push(name.to_string());
        }
        Ok(())
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.iter().any(|c| c == name)
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.iter().map(String::as_str)
    }

    /// Removes a wrapped chain, its rules, and every rule jumping to it.
    ///
    /// Returns `false` when the chain did not exist.
    pub fn remove_chain(&mut self, name: &str) -> bool {
        let Some(pos) = self.chains.iter().position(|c| c == name) else {
            return false;
        };
        self.chains.remove(pos);
        let jump = format!("${name}");
        self.rules.retain(|r| {
            !(r.wrap && r.chain == name) && !body_jumps_to(&r.body, &jump)
        });
        true
    }

    /// Removes every rule of a wrapped chain, keeping the chain itself.
    pub fn empty_chain(&mut self, name: &str) {
        self.rules.retain(|r| !(r.wrap && r.chain == name));
    }

    /// Appends a rule to a wrapped chain. Duplicates are skipped.
    pub fn add_rule(&mut self, chain: &str, body: impl Into<String>, top: bool) -> Result<()> {
        if !self.has_chain(chain) {
            return Err(Error::Internal(format!(
                "rule added to unknown chain {}",
                self.wrapped_name(chain)
            )));
        }
        let rule = TableRule {
            chain: chain.to_string(),
            body: body.into(),
            wrap: true,
            top,
        };
        if self.rules.contains(&rule) {
            tracing::debug!(chain, body = %rule.body, "Skipping duplicate rule");
        } else {
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Removes one rule from a wrapped chain; returns whether it was present.
    pub fn remove_rule(&mut self, chain: &str, body: &str) -> bool {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.wrap && r.chain == chain && r.body == body));
        self.rules.len() != before
    }

    /// Rule bodies of a wrapped chain, in order, with `$` references intact
    pub fn rules_in(&self, chain: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.wrap && r.chain == chain)
            .map(|r| r.body.as_str())
            .collect()
    }

    /// Chain declaration lines (`:<prefix>-x - [0:0]`)
    pub fn declarations(&self) -> Vec<String> {
        self.chains
            .iter()
            .map(|c| format!(":{} - [0:0]", self.wrapped_name(c)))
            .collect()
    }

    /// `-A` lines split into (top, bottom), with references expanded
    pub fn rule_lines(&self) -> (Vec<String>, Vec<String>) {
        let mut top = Vec::new();
        let mut bottom = Vec::new();
        for rule in &self.rules {
            let chain = if rule.wrap {
                self.wrapped_name(&rule.chain)
            } else {
                rule.chain.clone()
            };
            let line = format!("-A {chain} {}", self.expand_refs(&rule.body));
            if rule.top {
                top.push(line);
            } else {
                bottom.push(line);
            }
        }
        (top, bottom)
    }

    fn expand_refs(&self, body: &str) -> String {
        let mut out = String::with_capacity(body.len() + 16);
        for (i, token) in body.split(' ').enumerate() {
            if i > 0 {
                out.push(' ');
            }
            match token.strip_prefix('$') {
                Some(name) if self.has_chain(name) => {
                    let _ = write!(out, "{}-{name}", self.prefix);
                }
                _ => out.push_str(token),
            }
        }
        out
    }
}

/// Target of the `-j`/`-g` in a rule, if any
fn jump_target(rule: &str) -> Option<&str> {
    let mut tokens = rule.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "-j" || token == "-g" {
            return tokens.next();
        }
    }
    None
}

fn body_jumps_to(body: &str, target: &str) -> bool {
    jump_target(body) == Some(target)
}

/// A parsed `iptables-save` dump
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedTables {
    lines: Vec<String>,
    trailing_newline: bool,
}

/// Splits an optional `[pkts:bytes] ` counter prefix from a rule line
fn split_counters(line: &str) -> (Option<&str>, &str) {
    if line.starts_with('[')
        && let Some(end) = line.find("] ")
    {
        return (Some(&line[..=end]), &line[end + 2..]);
    }
    (None, line)
}

impl SavedTables {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            trailing_newline: text.ends_with('\n'),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Bounds of the `*filter` section: index of the header and of its COMMIT
    fn filter_section(&self) -> Option<(usize, usize)> {
        let start = self.lines.iter().position(|l| l.trim_end() == "*filter")?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|l| l.trim_end() == "COMMIT")
            .map(|i| start + 1 + i)?;
        Some((start, end))
    }

    /// Chains declared in the `*filter` section
    pub fn filter_chains(&self) -> Vec<&str> {
        let Some((start, end)) = self.filter_section() else {
            return Vec::new();
        };
        self.lines[start + 1..end]
            .iter()
            .filter_map(|l| l.strip_prefix(':'))
            .filter_map(|l| l.split_whitespace().next())
            .collect()
    }

    /// Replaces everything `table` owns in the `*filter` section.
    ///
    /// Owned lines are chain declarations with the table's prefix, rules in
    /// those chains, and rules in any chain that jump to them. Counters of a
    /// dropped rule are carried over to an identical regenerated rule.
    /// A dump without a `*filter` section gets one with the builtin chains.
    pub fn merge(&self, table: &FilterTable) -> Self {
        let mut lines = self.lines.clone();
        let (start, end) = if let Some(bounds) = self.filter_section() {
            bounds
        } else {
            let start = lines.len();
            lines.push("*filter".to_string());
            for builtin in BUILTIN_CHAINS {
                lines.push(format!(":{builtin} ACCEPT [0:0]"));
            }
            lines.push("COMMIT".to_string());
            (start, lines.len() - 1)
        };

        let owned_prefix = format!("{}-", table.prefix());
        let is_owned_chain = |name: &str| name.starts_with(&owned_prefix);

        let mut kept_decls = Vec::new();
        let mut kept_other = Vec::new();
        let mut counters: HashMap<String, Vec<String>> = HashMap::new();

        for line in &lines[start + 1..end] {
            if let Some(decl) = line.strip_prefix(':') {
                let name = decl.split_whitespace().next().unwrap_or_default();
                if !is_owned_chain(name) {
                    kept_decls.push(line.clone());
                }
                continue;
            }

            let (counter, rule) = split_counters(line);
            let mut tokens = rule.split_whitespace();
            let owned = match (tokens.next(), tokens.next()) {
                (Some("-A"), Some(chain)) => {
                    is_owned_chain(chain) || jump_target(rule).is_some_and(is_owned_chain)
                }
                _ => false,
            };

            if owned {
                if let Some(counter) = counter {
                    counters
                        .entry(rule.to_string())
                        .or_default()
                        .push(counter.to_string());
                }
            } else {
                kept_other.push(line.clone());
            }
        }

        let mut with_counters = |rule: String| -> String {
            let counter = counters
                .get_mut(&rule)
                .and_then(|c| (!c.is_empty()).then(|| c.remove(0)))
                .unwrap_or_else(|| "[0:0]".to_string());
            format!("{counter} {rule}")
        };

        let (top, bottom) = table.rule_lines();
        let mut section = Vec::with_capacity(end - start + top.len() + bottom.len() + 8);
        section.push(lines[start].clone());
        section.extend(kept_decls);
        section.extend(table.declarations());
        section.extend(top.into_iter().map(&mut with_counters));
        section.extend(kept_other);
        section.extend(bottom.into_iter().map(&mut with_counters));
        section.push(lines[end].clone());

        let mut merged = Vec::with_capacity(lines.len() + section.len());
        merged.extend_from_slice(&lines[..start]);
        merged.extend(section);
        merged.extend_from_slice(&lines[end + 1..]);

        Self {
            lines: merged,
            trailing_newline: self.trailing_newline || self.lines.is_empty(),
        }
    }
}
