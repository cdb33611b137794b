//! Parser and renderer for the kernel filter's textual rule-dump format (spec.md §6).
//!
//! The dump is a sequence of chain declarations followed by append-rule lines; each rule is
//! a whitespace-separated list of `<module> <args...>` match clauses terminated by a target
//! clause. This module is deliberately the single source of truth for that grammar: both the
//! live kernel shim (`save`/`restore`) and the offline debug converter parse through it.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Protocol;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchDir {
    Src,
    Dst,
}

impl MatchDir {
    fn as_str(&self) -> &'static str {
        match self {
            MatchDir::Src => "src",
            MatchDir::Dst => "dst",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetMatch {
    pub hashed_name: String,
    pub dirs: Vec<MatchDir>,
    pub negate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Match {
    Set(SetMatch),
    Port {
        protocol: Protocol,
        dport: Option<u16>,
        sport: Option<u16>,
    },
    Comment(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Target {
    MarkAndAccept(String),
    Drop,
    Return,
    Accept,
    Jump(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub target: Target,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleDump {
    pub chains: Vec<Chain>,
}

impl RuleDump {
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }
}

/// Splits a line into whitespace-separated tokens, keeping `"..."` comment text as one token
/// (with the surrounding quotes preserved, so the renderer can emit it back unchanged).
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.trim().chars().peekable();
    let mut buf = String::new();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        if c == '"' {
            in_quotes = !in_quotes;
            buf.push(c);
            if !in_quotes {
                tokens.push(std::mem::take(&mut buf));
            }
            continue;
        }
        if c.is_whitespace() && !in_quotes {
            if !buf.is_empty() {
                tokens.push(std::mem::take(&mut buf));
            }
            continue;
        }
        buf.push(c);
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }
    tokens
}

fn parse_port_clause(protocol: Protocol, tokens: &[String], pos: &mut usize) -> Result<Match> {
    let mut dport = None;
    let mut sport = None;
    loop {
        match tokens.get(*pos).map(String::as_str) {
            Some("--dport") => {
                *pos += 1;
                let v = tokens
                    .get(*pos)
                    .ok_or_else(|| Error::ParseError("--dport missing value".into()))?;
                dport = Some(v.parse::<u16>().map_err(|e| Error::ParseError(e.to_string()))?);
                *pos += 1;
            }
            Some("--sport") => {
                *pos += 1;
                let v = tokens
                    .get(*pos)
                    .ok_or_else(|| Error::ParseError("--sport missing value".into()))?;
                sport = Some(v.parse::<u16>().map_err(|e| Error::ParseError(e.to_string()))?);
                *pos += 1;
            }
            _ => break,
        }
    }
    Ok(Match::Port {
        protocol,
        dport,
        sport,
    })
}

fn parse_rule_clauses(tokens: &[String]) -> Result<Rule> {
    let mut pos = 0;
    let mut matches = Vec::new();
    loop {
        match tokens.get(pos).map(String::as_str) {
            Some("set") => {
                pos += 1;
                let mut negate = false;
                if tokens.get(pos).map(String::as_str) == Some("!") {
                    negate = true;
                    pos += 1;
                }
                if tokens.get(pos).map(String::as_str) != Some("--match-set") {
                    return Err(Error::ParseError("expected --match-set".into()));
                }
                pos += 1;
                let hashed_name = tokens
                    .get(pos)
                    .ok_or_else(|| Error::ParseError("--match-set missing name".into()))?
                    .clone();
                pos += 1;
                let dir_tok = tokens
                    .get(pos)
                    .ok_or_else(|| Error::ParseError("--match-set missing direction".into()))?;
                let dirs = dir_tok
                    .split(',')
                    .map(|d| match d {
                        "src" => Ok(MatchDir::Src),
                        "dst" => Ok(MatchDir::Dst),
                        other => Err(Error::ParseError(format!("unknown match direction {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                pos += 1;
                matches.push(Match::Set(SetMatch {
                    hashed_name,
                    dirs,
                    negate,
                }));
            }
            Some("tcp") => {
                pos += 1;
                matches.push(parse_port_clause(Protocol::Tcp, tokens, &mut pos)?);
            }
            Some("udp") => {
                pos += 1;
                matches.push(parse_port_clause(Protocol::Udp, tokens, &mut pos)?);
            }
            Some("sctp") => {
                pos += 1;
                matches.push(parse_port_clause(Protocol::Sctp, tokens, &mut pos)?);
            }
            Some("comment") => {
                pos += 1;
                if tokens.get(pos).map(String::as_str) != Some("--comment") {
                    return Err(Error::ParseError("expected --comment".into()));
                }
                pos += 1;
                let text = tokens
                    .get(pos)
                    .ok_or_else(|| Error::ParseError("--comment missing text".into()))?;
                matches.push(Match::Comment(
                    text.trim_matches('"').to_string(),
                ));
                pos += 1;
            }
            _ => break,
        }
    }

    let target = match tokens.get(pos).map(String::as_str) {
        Some("MARK") => {
            pos += 1;
            if tokens.get(pos).map(String::as_str) != Some("--set-xmark") {
                return Err(Error::ParseError("expected --set-xmark".into()));
            }
            pos += 1;
            let value = tokens
                .get(pos)
                .ok_or_else(|| Error::ParseError("--set-xmark missing value".into()))?
                .clone();
            Target::MarkAndAccept(value)
        }
        Some("DROP") => Target::Drop,
        Some("RETURN") => Target::Return,
        Some("ACCEPT") => Target::Accept,
        Some(chain) => Target::Jump(chain.to_string()),
        None => return Err(Error::ParseError("rule has no target clause".into())),
    };

    Ok(Rule { matches, target })
}

/// Parses a full rule dump.
///
/// Tolerant of leading/trailing whitespace and collapsed inter-token spaces; preserves rule
/// order within a chain (spec.md §6), which the Rule Engine depends on for peer-order
/// short-circuiting.
pub fn parse(text: &str) -> Result<RuleDump> {
    let mut chains: Vec<Chain> = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("-N ") {
            let name = rest.trim().to_string();
            if !chains.iter().any(|c| c.name == name) {
                chains.push(Chain {
                    name,
                    rules: Vec::new(),
                });
            }
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let tokens = tokenize(rest);
            let (chain_name, rule_tokens) = tokens
                .split_first()
                .ok_or_else(|| Error::ParseError("empty append line".into()))?;
            let rule = parse_rule_clauses(rule_tokens)?;
            match chains.iter_mut().find(|c| c.name == *chain_name) {
                Some(chain) => chain.rules.push(rule),
                None => chains.push(Chain {
                    name: chain_name.clone(),
                    rules: vec![rule],
                }),
            }
        } else {
            return Err(Error::ParseError(format!("unrecognised line: {line}")));
        }
    }
    Ok(RuleDump { chains })
}

fn render_match(m: &Match, out: &mut String) {
    match m {
        Match::Set(s) => {
            let dirs = s
                .dirs
                .iter()
                .map(MatchDir::as_str)
                .collect::<Vec<_>>()
                .join(",");
            if s.negate {
                let _ = write!(out, "set ! --match-set {} {} ", s.hashed_name, dirs);
            } else {
                let _ = write!(out, "set --match-set {} {} ", s.hashed_name, dirs);
            }
        }
        Match::Port {
            protocol,
            dport,
            sport,
        } => {
            let _ = write!(out, "{} ", protocol.as_str());
            if let Some(p) = sport {
                let _ = write!(out, "--sport {} ", p);
            }
            if let Some(p) = dport {
                let _ = write!(out, "--dport {} ", p);
            }
        }
        Match::Comment(text) => {
            let _ = write!(out, "comment --comment \"{}\" ", text);
        }
    }
}

fn render_target(t: &Target, out: &mut String) {
    match t {
        Target::MarkAndAccept(value) => {
            let _ = write!(out, "MARK --set-xmark {}", value);
        }
        Target::Drop => out.push_str("DROP"),
        Target::Return => out.push_str("RETURN"),
        Target::Accept => out.push_str("ACCEPT"),
        Target::Jump(chain) => out.push_str(chain),
    }
}

/// Renders a rule dump back to its textual form. `parse(render(parse(text)))` is a fixed
/// point (spec.md §8).
pub fn render(dump: &RuleDump) -> String {
    let mut out = String::new();
    for chain in &dump.chains {
        let _ = writeln!(out, "-N {}", chain.name);
    }
    for chain in &dump.chains {
        for rule in &chain.rules {
            let _ = write!(out, "-A {} ", chain.name);
            for m in &rule.matches {
                render_match(m, &mut out);
            }
            render_target(&rule.target, &mut out);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ingress_chain_with_drop() {
        let text = "\
-N AZURE-NPM-INGRESS
-A AZURE-NPM-INGRESS set --match-set azure-npm-1 dst set --match-set azure-npm-2 src tcp --dport 80 comment --comment \"allow from a to b\" MARK --set-xmark 0x2000
-A AZURE-NPM-INGRESS set --match-set azure-npm-1 dst DROP
";
        let dump = parse(text).unwrap();
        let chain = dump.chain("AZURE-NPM-INGRESS").unwrap();
        assert_eq!(chain.rules.len(), 2);
        assert_eq!(chain.rules[1].target, Target::Drop);
        match &chain.rules[0].matches[0] {
            Match::Set(s) => assert_eq!(s.hashed_name, "azure-npm-1"),
            _ => panic!("expected set match"),
        }
    }

    #[test]
    fn parses_negated_set_match() {
        let text = "-N C\n-A C set ! --match-set azure-npm-9 src,dst DROP\n";
        let dump = parse(text).unwrap();
        match &dump.chain("C").unwrap().rules[0].matches[0] {
            Match::Set(s) => {
                assert!(s.negate);
                assert_eq!(s.dirs, vec![MatchDir::Src, MatchDir::Dst]);
            }
            _ => panic!("expected set match"),
        }
    }

    #[test]
    fn round_trip_is_a_fixed_point() {
        let text = "\
-N AZURE-NPM-EGRESS
-A AZURE-NPM-EGRESS set --match-set azure-npm-1 src udp --sport 53 AZURE-NPM-EGRESS-ABC123
-A AZURE-NPM-EGRESS RETURN
";
        let once = parse(text).unwrap();
        let rendered = render(&once);
        let twice = parse(&rendered).unwrap();
        assert_eq!(once, twice);
        let rendered_again = render(&twice);
        assert_eq!(rendered, rendered_again);
    }

    #[test]
    fn tolerates_collapsed_whitespace() {
        let text = "  -N C  \n  -A C   set  --match-set  azure-npm-1   dst   ACCEPT  \n";
        let dump = parse(text).unwrap();
        assert_eq!(dump.chain("C").unwrap().rules[0].target, Target::Accept);
    }

    #[test]
    fn jump_to_subchain_target() {
        let dump = parse("-N TOP\n-A TOP AZURE-NPM-INGRESS-abc\n").unwrap();
        assert_eq!(
            dump.chain("TOP").unwrap().rules[0].target,
            Target::Jump("AZURE-NPM-INGRESS-abc".to_string())
        );
    }
}
